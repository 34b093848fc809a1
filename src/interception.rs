//! Request classification for intercepted page requests.
//!
//! Every request is allowed to proceed. Classification only feeds the
//! diagnostic summary logged once the page is prepared.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Font,
    Image,
    Icon,
    Stylesheet,
    Other,
}

impl ResourceClass {
    /// Fonts, images and icon assets are what capture fidelity depends on.
    pub fn is_priority(self) -> bool {
        matches!(
            self,
            ResourceClass::Font | ResourceClass::Image | ResourceClass::Icon
        )
    }
}

pub struct RequestClassifier {
    font_extensions: HashSet<&'static str>,
    image_extensions: HashSet<&'static str>,
    icon_patterns: Vec<&'static str>,
    counts: [AtomicUsize; 5],
}

impl RequestClassifier {
    pub fn new() -> Self {
        Self {
            font_extensions: ["woff", "woff2", "ttf", "otf", "eot"].into_iter().collect(),
            image_extensions: ["png", "jpg", "jpeg", "gif", "webp", "avif", "bmp", "svg", "ico"]
                .into_iter()
                .collect(),
            icon_patterns: vec![
                "icon",
                "favicon",
                "fontawesome",
                "font-awesome",
                "material-icons",
                "materialicons",
                "iconfont",
                "glyph",
                "sprite",
            ],
            counts: Default::default(),
        }
    }

    /// Classify a request from its URL and the browser-reported resource type.
    pub fn classify(&self, url: &str, resource_type: &str) -> ResourceClass {
        let resource_type = resource_type.to_ascii_lowercase();
        let url_lower = url.to_ascii_lowercase();
        let extension = Self::extension(&url_lower);
        let iconish = self.contains_icon_pattern(&url_lower);

        match resource_type.as_str() {
            "font" => {
                if iconish {
                    ResourceClass::Icon
                } else {
                    ResourceClass::Font
                }
            }
            "image" => {
                if iconish || extension.as_deref() == Some("ico") {
                    ResourceClass::Icon
                } else {
                    ResourceClass::Image
                }
            }
            "stylesheet" => {
                if iconish {
                    ResourceClass::Icon
                } else {
                    ResourceClass::Stylesheet
                }
            }
            _ => match extension.as_deref() {
                Some(ext) if self.font_extensions.contains(ext) => ResourceClass::Font,
                Some(ext) if self.image_extensions.contains(ext) => {
                    if iconish {
                        ResourceClass::Icon
                    } else {
                        ResourceClass::Image
                    }
                }
                Some("css") => ResourceClass::Stylesheet,
                _ => ResourceClass::Other,
            },
        }
    }

    /// Classify and count a request.
    pub fn record(&self, url: &str, resource_type: &str) -> ResourceClass {
        let class = self.classify(url, resource_type);
        self.counts[Self::slot(class)].fetch_add(1, Ordering::Relaxed);
        class
    }

    pub fn count(&self, class: ResourceClass) -> usize {
        self.counts[Self::slot(class)].load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> InterceptionSummary {
        InterceptionSummary {
            fonts: self.count(ResourceClass::Font),
            images: self.count(ResourceClass::Image),
            icons: self.count(ResourceClass::Icon),
            stylesheets: self.count(ResourceClass::Stylesheet),
            other: self.count(ResourceClass::Other),
        }
    }

    fn slot(class: ResourceClass) -> usize {
        match class {
            ResourceClass::Font => 0,
            ResourceClass::Image => 1,
            ResourceClass::Icon => 2,
            ResourceClass::Stylesheet => 3,
            ResourceClass::Other => 4,
        }
    }

    fn contains_icon_pattern(&self, url: &str) -> bool {
        self.icon_patterns.iter().any(|pattern| url.contains(pattern))
    }

    fn extension(url: &str) -> Option<String> {
        let path = match Url::parse(url) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
        };
        let file = path.rsplit('/').next()?;
        let (_, ext) = file.rsplit_once('.')?;
        Some(ext.to_string())
    }
}

impl Default for RequestClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterceptionSummary {
    pub fonts: usize,
    pub images: usize,
    pub icons: usize,
    pub stylesheets: usize,
    pub other: usize,
}

impl InterceptionSummary {
    pub fn total(&self) -> usize {
        self.fonts + self.images + self.icons + self.stylesheets + self.other
    }
}

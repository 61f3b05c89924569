//! Saliency target-layer specification.

/// The layer Grad-CAM reads from, with an ordered list of alternatives.
///
/// Resolution is a plain lookup against the layers a model exposes; it is
/// repeated per request rather than cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLayerSpec {
    primary: String,
    fallbacks: Vec<String>,
}

impl TargetLayerSpec {
    /// Spec with no fallbacks.
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            fallbacks: Vec::new(),
        }
    }

    /// Append fallback layer names.
    #[must_use]
    pub fn with_fallbacks<I, S>(mut self, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallbacks.extend(fallbacks.into_iter().map(Into::into));
        self
    }

    /// Primary layer name.
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Fallback layer names in order.
    pub fn fallbacks(&self) -> &[String] {
        &self.fallbacks
    }

    /// Primary followed by fallbacks, without repeats.
    pub fn candidates(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::with_capacity(1 + self.fallbacks.len());
        for name in std::iter::once(&self.primary).chain(&self.fallbacks) {
            if !out.contains(&name.as_str()) {
                out.push(name);
            }
        }
        out
    }

    /// First candidate for which `exists` returns true.
    pub fn resolve<F>(&self, exists: F) -> Option<&str>
    where
        F: Fn(&str) -> bool,
    {
        self.candidates().into_iter().find(|name| exists(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_wins() {
        let spec = TargetLayerSpec::new("conv5_block3_out").with_fallbacks(["Conv_1"]);
        let resolved = spec.resolve(|name| name == "conv5_block3_out" || name == "Conv_1");
        assert_eq!(resolved, Some("conv5_block3_out"));
    }

    #[test]
    fn test_fallback_order() {
        let spec = TargetLayerSpec::new("missing").with_fallbacks(["also_missing", "b", "a"]);
        assert_eq!(spec.resolve(|name| name == "a" || name == "b"), Some("b"));
    }

    #[test]
    fn test_nothing_resolves() {
        let spec = TargetLayerSpec::new("missing").with_fallbacks(["gone"]);
        assert_eq!(spec.resolve(|_| false), None);
    }

    #[test]
    fn test_candidates_deduplicated() {
        let spec = TargetLayerSpec::new("Conv_1").with_fallbacks(["block_16", "Conv_1"]);
        assert_eq!(spec.candidates(), vec!["Conv_1", "block_16"]);
    }
}

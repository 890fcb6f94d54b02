//! Purpose: Per-runtime configuration for parameter surfacing and attribute mapping.
//! Exports: `RuntimeConfig`, `AttributeMapping`, `DEFAULT_MAX_PLUGINS`.
//! Role: Plain values handed to `RuntimeContext::new`; no file or env parsing here.
use crate::core::parm::DEFAULT_PARAMETER_PREFIX;

pub const DEFAULT_MAX_PLUGINS: usize = 10;

/// Pairs a host vertex attribute with its engine counterpart.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeMapping {
    pub host: String,
    pub engine: String,
    pub components: usize,
}

impl AttributeMapping {
    pub fn new(host: impl Into<String>, engine: impl Into<String>, components: usize) -> Self {
        Self {
            host: host.into(),
            engine: engine.into(),
            components,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuntimeConfig {
    pub parameter_prefix: String,
    pub max_plugins: usize,
    /// Host attributes pushed into the input node before a cook.
    pub input_attributes: Vec<AttributeMapping>,
    /// Engine attributes pulled into the output mesh after a cook.
    pub output_attributes: Vec<AttributeMapping>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            parameter_prefix: DEFAULT_PARAMETER_PREFIX.to_string(),
            max_plugins: DEFAULT_MAX_PLUGINS,
            input_attributes: vec![
                AttributeMapping::new("color0", "Cd", 4),
                AttributeMapping::new("uv0", "uv", 2),
            ],
            output_attributes: vec![AttributeMapping::new("uv0", "uv", 2)],
        }
    }
}

impl RuntimeConfig {
    pub fn with_parameter_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.parameter_prefix = prefix.into();
        self
    }

    pub fn with_max_plugins(mut self, max_plugins: usize) -> Self {
        self.max_plugins = max_plugins;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::RuntimeConfig;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.parameter_prefix, "mfx_");
        assert_eq!(config.max_plugins, 10);
        assert_eq!(config.output_attributes[0].engine, "uv");
        let config = config.with_parameter_prefix("p_").with_max_plugins(2);
        assert_eq!((config.parameter_prefix.as_str(), config.max_plugins), ("p_", 2));
    }
}

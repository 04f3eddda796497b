//! Collaborators handed to the engine at construction.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use crate::core::completion::{CompletionClassifier, IndicatorClassifier};
use crate::io::Layout;
use crate::io::assistant::{Assistant, CommandAssistant};
use crate::io::config::{EngineConfig, load_config};
use crate::io::probe::{ProcProbe, ResourceProbe};

/// Builds a fresh probe for each session's monitor.
pub type ProbeFactory = Arc<dyn Fn() -> Box<dyn ResourceProbe> + Send + Sync>;

pub struct EngineContext {
    pub layout: Layout,
    pub config: EngineConfig,
    pub assistant: Arc<dyn Assistant>,
    pub classifier: Arc<dyn CompletionClassifier>,
    pub probe: ProbeFactory,
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("layout", &self.layout)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    /// Validates `config` and builds the indicator classifier it describes.
    pub fn new(layout: Layout, config: EngineConfig, assistant: Arc<dyn Assistant>) -> Result<Self> {
        config.validate().context("invalid engine config")?;
        let classifier = IndicatorClassifier::new(
            config.completion.success_indicators.as_slice(),
            config.completion.failure_indicators.as_slice(),
        )?;
        Ok(Self {
            layout,
            config,
            assistant,
            classifier: Arc::new(classifier),
            probe: Arc::new(|| Box::new(ProcProbe::new())),
        })
    }

    /// Load `.taskpilot/config.toml` under `root` and wire the command assistant.
    pub fn for_workspace(root: &Path) -> Result<Self> {
        let layout = Layout::new(root);
        let config_path = layout.config_path();
        let config = load_config(&config_path)
            .with_context(|| format!("load config {}", config_path.display()))?;
        let assistant = CommandAssistant::new(&config.assistant.command, root).ok_or_else(|| {
            anyhow!(
                "assistant.command is empty; set it in {}",
                config_path.display()
            )
        })?;
        Self::new(layout, config, Arc::new(assistant))
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn CompletionClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_probe(mut self, probe: ProbeFactory) -> Self {
        self.probe = probe;
        self
    }

    pub fn specs_root(&self) -> std::path::PathBuf {
        self.layout.specs_dir(&self.config.specs_dir)
    }
}

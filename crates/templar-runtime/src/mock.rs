use crate::customize::{CustomizationPlan, CustomizeOp, Customizer};
use crate::RuntimeError;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A recorded customization call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomizeCall {
    pub template: String,
    pub image: PathBuf,
    pub ops: Vec<String>,
}

/// Customizer that records calls and appends a marker line to the image
/// instead of running any tool.
#[derive(Default)]
pub struct MockCustomizer {
    calls: Mutex<Vec<CustomizeCall>>,
    failing: Mutex<HashSet<String>>,
}

impl MockCustomizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every customization of `template` fail.
    pub fn fail_for(&self, template: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(template.to_owned());
        }
    }

    pub fn calls(&self) -> Vec<CustomizeCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Customizer for MockCustomizer {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn customize(&self, image: &Path, plan: &CustomizationPlan) -> Result<(), RuntimeError> {
        let template = plan.template().to_owned();
        self.calls
            .lock()
            .map_err(|e| RuntimeError::Customization {
                template: template.clone(),
                status: "mutex poisoned".to_owned(),
                output: e.to_string(),
            })?
            .push(CustomizeCall {
                template: template.clone(),
                image: image.to_path_buf(),
                ops: plan.ops().iter().map(CustomizeOp::describe).collect(),
            });

        let should_fail = self
            .failing
            .lock()
            .map(|f| f.contains(&template))
            .unwrap_or(false);
        if should_fail {
            return Err(RuntimeError::Customization {
                template,
                status: "exit status: 1".to_owned(),
                output: "mock: injected failure".to_owned(),
            });
        }

        let mut file = OpenOptions::new().append(true).open(image)?;
        writeln!(file, "customized:{template}")?;
        Ok(())
    }
}

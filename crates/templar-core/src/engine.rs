use crate::concurrency::{shutdown_requested, StoreLock};
use crate::drift::{classify, reconcile, DriftWarning, StatusReport};
use crate::lifecycle::{validate_transition, TemplateState};
use crate::{CoreError, EngineConfig, Selection};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use templar_platform::{
    allocate, live_templates, AllocError, Platform, PlatformErrorKind, VmSpec,
};
use templar_runtime::{CustomizationPlan, Customizer, ImageCache, RuntimeError};
use templar_schema::{
    Catalog, ImageSource, ImportManifest, ManifestOrigin, TemplateDefinition, VmSettings,
};
use templar_store::{
    now_timestamp, BuildMetadata, MetadataMap, MetadataStore, StoreLayout, WORK_DIR_PREFIX,
};
use tracing::{debug, error, info, warn};

/// Which catalog flow [`Engine::run`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Fill gaps: only templates with no live counterpart.
    Build,
    /// Rebuild live templates from the (possibly cached) base image,
    /// keeping their identifiers.
    Update,
    /// Like `Update`, with a fresh download.
    Rebuild,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Update => "update",
            Self::Rebuild => "rebuild",
        }
    }

    fn replaces_live(self) -> bool {
        matches!(self, Self::Update | Self::Rebuild)
    }
}

/// Terminal result for one template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Converted { vmid: u32 },
    Skipped { reason: String },
    Failed { stage: TemplateState, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateReport {
    pub name: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub templates: Vec<TemplateReport>,
    pub drift: Vec<DriftWarning>,
    pub interrupted: bool,
}

impl RunReport {
    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.templates.iter().filter(|t| pred(&t.outcome)).count()
    }

    pub fn converted(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Converted { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0 || self.interrupted
    }

    pub fn get(&self, name: &str) -> Option<&Outcome> {
        self.templates
            .iter()
            .find(|t| t.name == name)
            .map(|t| &t.outcome)
    }
}

/// Called on every state change of a template.
pub type ProgressFn = Box<dyn Fn(&str, TemplateState) + Send + Sync>;

/// Where the new template is built and what happens to the one it replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Nothing to replace.
    Fresh { vmid: u32 },
    /// Build at `staging`, then move the result onto `target` (the live
    /// template's identifier) once it is a template.
    Staged { staging: u32, target: u32 },
    /// Build at `vmid`, then remove `previous`.
    Alongside { vmid: u32, previous: u32 },
    /// Remove the live template at `vmid` first, then build there.
    DestroyFirst { vmid: u32 },
}

/// How the record's timestamps move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stamp {
    Built,
    Updated,
    Rebuilt,
}

impl Stamp {
    fn apply(self, previous: Option<&BuildMetadata>, now: &str) -> BuildMetadata {
        let prev = previous.cloned().unwrap_or_default();
        let (build_date, last_update) = match self {
            Self::Built => (Some(now.to_owned()), prev.last_update),
            Self::Updated => (
                prev.build_date.or_else(|| Some(now.to_owned())),
                Some(now.to_owned()),
            ),
            Self::Rebuilt => (Some(now.to_owned()), Some(now.to_owned())),
        };
        BuildMetadata {
            vmid: None,
            build_date,
            last_update,
        }
    }
}

enum Step {
    Skipped(String),
    Converted { vmid: u32, record: BuildMetadata },
}

/// Image ready for import. Holds the scratch copy alive until the job ends.
struct PreparedImage {
    path: PathBuf,
    _scratch: Option<NamedTempFile>,
}

/// Per-template bookkeeping: current state and the identifiers this run
/// created, which are what failure cleanup may destroy.
struct Job<'a> {
    name: String,
    state: TemplateState,
    created: Vec<u32>,
    progress: Option<&'a ProgressFn>,
    interrupted: fn() -> bool,
}

impl Job<'_> {
    fn advance(&mut self, to: TemplateState) -> Result<(), CoreError> {
        if (self.interrupted)() {
            return Err(RuntimeError::Interrupted {
                template: self.name.clone(),
            }
            .into());
        }
        validate_transition(self.state, to)?;
        self.enter(to);
        Ok(())
    }

    fn finish(&mut self, to: TemplateState) {
        if let Err(e) = validate_transition(self.state, to) {
            warn!("[{}] {e}", self.name);
        }
        self.enter(to);
    }

    fn enter(&mut self, to: TemplateState) {
        debug!("[{}] {} -> {to}", self.name, self.state);
        self.state = to;
        if let Some(progress) = self.progress {
            progress(&self.name, to);
        }
    }

    fn skip(&mut self, reason: String) -> Result<Step, CoreError> {
        info!("[{}] skipped: {reason}", self.name);
        self.finish(TemplateState::Skipped);
        Ok(Step::Skipped(reason))
    }
}

/// Central orchestration engine for template lifecycles.
///
/// Templates are processed one at a time; a failure ends that template
/// (after destroying whatever the run created for it) and the batch moves on.
/// Metadata is written after every converted template.
pub struct Engine {
    config: EngineConfig,
    layout: StoreLayout,
    catalog: Catalog,
    platform: Arc<dyn Platform>,
    customizer: Arc<dyn Customizer>,
    cache: ImageCache,
    metadata: MetadataStore,
    progress: Option<ProgressFn>,
    interrupted: fn() -> bool,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        layout: StoreLayout,
        catalog: Catalog,
        platform: Arc<dyn Platform>,
        customizer: Arc<dyn Customizer>,
    ) -> Self {
        let cache = ImageCache::new(layout.cache_dir());
        let metadata = MetadataStore::new(layout.metadata_file());
        Self {
            config,
            layout,
            catalog,
            platform,
            customizer,
            cache,
            metadata,
            progress: None,
            interrupted: shutdown_requested,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Replace the interrupt check (the Ctrl-C flag by default).
    #[must_use]
    pub fn with_interrupt_check(mut self, check: fn() -> bool) -> Self {
        self.interrupted = check;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    /// Build, update or rebuild the selected catalog templates.
    ///
    /// Selection, catalog and storage problems are returned before anything
    /// is touched. Per-template failures are reported in the [`RunReport`].
    pub fn run(&self, mode: RunMode, selection: &Selection) -> Result<RunReport, CoreError> {
        let names = selection.apply(&self.catalog.template_names())?;
        let definitions = names
            .iter()
            .map(|n| self.catalog.resolve(n))
            .collect::<Result<Vec<_>, _>>()?;
        let storage = self.select_storage()?;
        info!(
            "{} run: {} template(s), storage '{storage}'",
            mode.as_str(),
            definitions.len()
        );

        let _lock = self.prepare()?;
        let mut metadata = self.metadata.load()?;
        let mut report = RunReport {
            drift: self.check_drift(&metadata)?,
            ..RunReport::default()
        };

        for def in &definitions {
            let name = def.name.as_str();
            if (self.interrupted)() {
                report.interrupted = true;
                report.templates.push(self.not_started(name));
                continue;
            }
            let mut job = self.job(name);
            let result = self.process_definition(&mut job, def, mode, &storage, &metadata);
            report.templates.push(self.conclude(job, result, &mut metadata)?);
        }
        report.interrupted |= (self.interrupted)();
        Ok(report)
    }

    /// Import pre-built images described by `manifest`.
    ///
    /// Entries whose template is already live are skipped unless `force`.
    /// Entries flagged `customize` run the catalog definition of the same
    /// name against the imported image, so they must exist in the catalog.
    pub fn import_manifest(
        &self,
        manifest: &ImportManifest,
        origin: &ManifestOrigin,
        selection: &Selection,
        force: bool,
    ) -> Result<RunReport, CoreError> {
        let names = selection.apply(&manifest.names())?;
        for name in &names {
            let wants_customize = manifest
                .entries
                .get(name.as_str())
                .is_some_and(|e| e.customize);
            if wants_customize && !self.catalog.contains(name) {
                return Err(CoreError::Config(format!(
                    "manifest entry '{name}' requests customization but the catalog has no such template"
                )));
            }
        }
        let storage = self.select_storage()?;
        info!("importing {} template(s) to storage '{storage}'", names.len());

        let _lock = self.prepare()?;
        let mut metadata = self.metadata.load()?;
        let mut report = RunReport {
            drift: self.check_drift(&metadata)?,
            ..RunReport::default()
        };

        for (name, entry) in &manifest.entries {
            let name = name.as_str();
            if !names.iter().any(|n| n == name) {
                continue;
            }
            if (self.interrupted)() {
                report.interrupted = true;
                report.templates.push(self.not_started(name));
                continue;
            }
            let source = origin.resolve(&entry.source);
            let mut job = self.job(name);
            let result = self.process_import(
                &mut job,
                &source,
                entry.vmid,
                entry.customize,
                force,
                &storage,
                &metadata,
            );
            report.templates.push(self.conclude(job, result, &mut metadata)?);
        }
        report.interrupted |= (self.interrupted)();
        Ok(report)
    }

    /// Read-only comparison of metadata with the live platform.
    pub fn status(&self, selection: &Selection) -> Result<StatusReport, CoreError> {
        let names = selection.apply(&self.catalog.template_names())?;
        let metadata = self.metadata.load()?;
        let live = self.platform.list_resources()?;
        let drift = reconcile(&metadata, &live)
            .into_iter()
            .filter(|d| names.contains(&d.name))
            .collect();
        Ok(StatusReport {
            templates: classify(&names, &metadata, &live),
            drift,
        })
    }

    fn job(&self, name: &str) -> Job<'_> {
        let mut job = Job {
            name: name.to_owned(),
            state: TemplateState::Selected,
            created: Vec::new(),
            progress: self.progress.as_ref(),
            interrupted: self.interrupted,
        };
        job.enter(TemplateState::Selected);
        job
    }

    fn not_started(&self, name: &str) -> TemplateReport {
        let mut job = self.job(name);
        job.finish(TemplateState::Skipped);
        TemplateReport {
            name: name.to_owned(),
            outcome: Outcome::Skipped {
                reason: "run interrupted".to_owned(),
            },
        }
    }

    fn select_storage(&self) -> Result<String, CoreError> {
        self.platform
            .select_storage(self.config.storage.as_deref())
            .map_err(|e| match e.kind {
                PlatformErrorKind::NotFound => CoreError::Config(e.cause),
                _ => CoreError::Platform(e),
            })
    }

    fn prepare(&self) -> Result<StoreLock, CoreError> {
        let lock = StoreLock::acquire_or_fail(&self.layout.lock_file())?;
        self.layout.initialize()?;
        let swept = self.layout.sweep_work_dir()?;
        if swept > 0 {
            info!("removed {swept} leftover work file(s) from an earlier run");
        }
        Ok(lock)
    }

    fn check_drift(&self, metadata: &MetadataMap) -> Result<Vec<DriftWarning>, CoreError> {
        let drift = reconcile(metadata, &self.platform.list_resources()?);
        for d in &drift {
            warn!("{d}");
        }
        Ok(drift)
    }

    fn process_definition(
        &self,
        job: &mut Job<'_>,
        def: &TemplateDefinition,
        mode: RunMode,
        storage: &str,
        metadata: &MetadataMap,
    ) -> Result<Step, CoreError> {
        let name = def.name.as_str();
        let live = live_templates(&self.platform.list_resources()?);
        let existing = live.get(name).map(|r| r.vmid);

        let stamp = match (mode, existing) {
            (RunMode::Build, Some(vmid)) => {
                return job.skip(format!("live template exists as {vmid}"));
            }
            (_, Some(vmid)) if self.platform.has_linked_clones(vmid)? => {
                warn!("[{name}] template {vmid} has linked clones; not replacing it");
                return job.skip(format!("linked clones depend on template {vmid}"));
            }
            (RunMode::Build, None) => Stamp::Built,
            (_, None) => {
                info!("[{name}] no live template, building it");
                Stamp::Built
            }
            (RunMode::Update, Some(_)) => Stamp::Updated,
            (RunMode::Rebuild, Some(_)) => Stamp::Rebuilt,
        };
        let previous = metadata.get(name);

        job.advance(TemplateState::Allocating)?;
        let placement = self.place(name, existing, None, previous.and_then(|m| m.vmid))?;

        job.advance(TemplateState::Acquiring)?;
        let source = self.catalog_source(&def.image_url);
        let image = self.cache.acquire(&source, mode == RunMode::Rebuild)?;

        let plan = CustomizationPlan::from_definition(def, mode.replaces_live());
        let prepared = self.customize(job, &image, &plan)?;

        self.deliver(job, &def.vm, &prepared.path, storage, placement, stamp, previous)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_import(
        &self,
        job: &mut Job<'_>,
        source: &ImageSource,
        requested: Option<u32>,
        customize: bool,
        force: bool,
        storage: &str,
        metadata: &MetadataMap,
    ) -> Result<Step, CoreError> {
        let name = job.name.clone();
        let live = live_templates(&self.platform.list_resources()?);
        let existing = live.get(&name).map(|r| r.vmid);

        let stamp = match existing {
            Some(vmid) if !force => {
                warn!("[{name}] live template exists as {vmid}; skipping (force to replace)");
                return job.skip(format!("live template exists as {vmid}"));
            }
            Some(vmid) if self.platform.has_linked_clones(vmid)? => {
                warn!("[{name}] template {vmid} has linked clones; not replacing it");
                return job.skip(format!("linked clones depend on template {vmid}"));
            }
            Some(_) => Stamp::Rebuilt,
            None => Stamp::Built,
        };
        let previous = metadata.get(&name);
        let def = if self.catalog.contains(&name) {
            Some(self.catalog.resolve(&name)?)
        } else {
            None
        };

        job.advance(TemplateState::Allocating)?;
        let placement = self.place(&name, existing, requested, previous.and_then(|m| m.vmid))?;

        job.advance(TemplateState::Acquiring)?;
        let image = self.cache.acquire(source, force)?;

        let prepared = match def.as_ref().filter(|_| customize) {
            Some(def) => self.customize(job, &image, &CustomizationPlan::from_definition(def, false))?,
            None => PreparedImage {
                path: image,
                _scratch: None,
            },
        };

        let vm = def.map(|d| d.vm).unwrap_or_default();
        self.deliver(job, &vm, &prepared.path, storage, placement, stamp, previous)
    }

    /// Catalog image references that are relative paths are relative to
    /// the catalog file.
    fn catalog_source(&self, raw: &str) -> ImageSource {
        match (ImageSource::parse(raw), &self.catalog.base_dir) {
            (ImageSource::Path(p), Some(base)) if p.is_relative() => ImageSource::Path(base.join(p)),
            (source, _) => source,
        }
    }

    /// Decide the identifiers for this template against a fresh listing.
    fn place(
        &self,
        name: &str,
        existing: Option<u32>,
        requested: Option<u32>,
        stored: Option<u32>,
    ) -> Result<Placement, CoreError> {
        let in_use: HashSet<u32> = self
            .platform
            .list_resources()?
            .into_iter()
            .map(|r| r.vmid)
            .collect();

        let Some(live) = existing else {
            if let Some(vmid) = requested {
                return Ok(Placement::Fresh { vmid });
            }
            if let Some(vmid) = stored {
                if !in_use.contains(&vmid) {
                    debug!("[{name}] reusing recorded vmid {vmid}");
                    return Ok(Placement::Fresh { vmid });
                }
                info!("[{name}] recorded vmid {vmid} is taken; allocating a new one");
            }
            let vmid = allocate(self.config.range, &in_use)?;
            return Ok(Placement::Fresh { vmid });
        };

        if let Some(vmid) = requested.filter(|r| *r != live) {
            return Ok(Placement::Alongside {
                vmid,
                previous: live,
            });
        }
        if !self.platform.supports_clone() {
            warn!(
                "[{name}] {} cannot clone; template {live} will be destroyed before its replacement is built",
                self.platform.name()
            );
            return Ok(Placement::DestroyFirst { vmid: live });
        }
        match allocate(self.config.range, &in_use) {
            Ok(staging) => Ok(Placement::Staged {
                staging,
                target: live,
            }),
            Err(AllocError::Exhausted { min, max }) => {
                warn!(
                    "[{name}] no free staging identifier in [{min}, {max}); template {live} will be destroyed before its replacement is built"
                );
                Ok(Placement::DestroyFirst { vmid: live })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Copy `image` into the work directory and run `plan` on the copy. The
    /// cached image is never modified.
    fn customize(
        &self,
        job: &mut Job<'_>,
        image: &Path,
        plan: &CustomizationPlan,
    ) -> Result<PreparedImage, CoreError> {
        if plan.is_empty() {
            debug!("[{}] nothing to customize", job.name);
            return Ok(PreparedImage {
                path: image.to_path_buf(),
                _scratch: None,
            });
        }
        job.advance(TemplateState::Customizing)?;
        let suffix = image
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{WORK_DIR_PREFIX}{}.", job.name))
            .suffix(&suffix)
            .tempfile_in(self.layout.work_dir())?;
        std::fs::copy(image, scratch.path())?;
        info!(
            "[{}] customizing with {} ({} operation(s))",
            job.name,
            self.customizer.name(),
            plan.ops().len()
        );
        self.customizer.customize(scratch.path(), plan)?;
        Ok(PreparedImage {
            path: scratch.path().to_path_buf(),
            _scratch: Some(scratch),
        })
    }

    /// Create, import, configure and convert; then settle the replaced
    /// template according to `placement`.
    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &self,
        job: &mut Job<'_>,
        vm: &VmSettings,
        image: &Path,
        storage: &str,
        mut placement: Placement,
        stamp: Stamp,
        previous: Option<&BuildMetadata>,
    ) -> Result<Step, CoreError> {
        let name = job.name.clone();
        job.advance(TemplateState::Importing)?;
        let vmid = self.create(job, &mut placement, vm)?;
        let volume = self.platform.import_disk(vmid, image, storage)?;
        debug!("[{name}] imported disk as {volume}");

        job.advance(TemplateState::Configuring)?;
        let mut record = stamp.apply(previous, &now_timestamp());
        let note = serde_json::json!({
            "name": name,
            "build_date": record.build_date,
            "last_update": record.last_update,
        })
        .to_string();
        self.configure(&name, vmid, vm, storage, &note)?;
        self.platform.convert_to_template(vmid)?;

        let vmid = self.settle(job, placement, vmid)?;
        record.vmid = Some(vmid);
        job.finish(TemplateState::Converted);
        Ok(Step::Converted { vmid, record })
    }

    fn create(
        &self,
        job: &mut Job<'_>,
        placement: &mut Placement,
        vm: &VmSettings,
    ) -> Result<u32, CoreError> {
        let spec = VmSpec {
            memory_mb: vm.memory_mb,
            cores: vm.cores,
            bridge: vm.bridge.clone(),
        };
        let vmid = match *placement {
            Placement::Fresh { vmid } | Placement::Alongside { vmid, .. } => vmid,
            Placement::Staged { staging, .. } => staging,
            Placement::DestroyFirst { vmid } => {
                warn!(
                    "[{}] degraded replacement: destroying template {vmid}; it is unavailable until this build completes",
                    job.name
                );
                self.platform.destroy(vmid)?;
                vmid
            }
        };

        match self.platform.create(vmid, &job.name, &spec) {
            Ok(()) => {
                job.created.push(vmid);
                Ok(vmid)
            }
            Err(e) if e.is_conflict() => {
                let Placement::Staged { target, .. } = *placement else {
                    return Err(e.into());
                };
                warn!(
                    "[{}] staging vmid {vmid} was taken before creation; degraded replacement: destroying template {target} first",
                    job.name
                );
                self.platform.destroy(target)?;
                *placement = Placement::Fresh { vmid: target };
                self.platform.create(target, &job.name, &spec)?;
                job.created.push(target);
                Ok(target)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn configure(
        &self,
        name: &str,
        vmid: u32,
        vm: &VmSettings,
        storage: &str,
        note: &str,
    ) -> Result<(), CoreError> {
        let p = &self.platform;
        p.set_config(vmid, "boot", "c")?;
        p.set_config(vmid, "bootdisk", "scsi0")?;
        if let Err(e) = p.set_config(vmid, "ide2", &format!("{storage}:cloudinit")) {
            warn!("[{name}] no cloud-init drive on {vmid}: {e}");
        }
        if let Some(user) = &vm.ssh_user {
            p.set_config(vmid, "ciuser", user)?;
        }
        if vm.firewall {
            p.set_config(vmid, "net0", &format!("virtio,bridge={},firewall=1", vm.bridge))?;
        }
        p.set_config(vmid, "description", note)?;
        Ok(())
    }

    /// Put the converted template at its final identifier and retire the
    /// one it replaces. Returns the final identifier.
    fn settle(&self, job: &mut Job<'_>, placement: Placement, built: u32) -> Result<u32, CoreError> {
        let name = job.name.clone();
        match placement {
            Placement::Fresh { .. } | Placement::DestroyFirst { .. } => Ok(built),
            Placement::Alongside { vmid, previous } => {
                if let Err(e) = self.platform.destroy(previous) {
                    warn!("[{name}] new template is {vmid} but {previous} could not be removed: {e}");
                }
                Ok(vmid)
            }
            Placement::Staged { staging, target } => {
                self.platform.destroy(target)?;
                // From here on the staging template is the only copy.
                job.created.retain(|id| *id != staging);
                if let Err(e) = self.platform.clone_resource(staging, target, &name) {
                    warn!(
                        "[{name}] template {target} was removed but cloning {staging} onto it failed; the new template remains at {staging}"
                    );
                    return Err(e.into());
                }
                job.created.push(target);
                self.platform.convert_to_template(target)?;
                if let Err(e) = self.platform.destroy(staging) {
                    warn!("[{name}] staging template {staging} could not be removed: {e}");
                }
                info!("[{name}] replaced template {target} in place");
                Ok(target)
            }
        }
    }

    fn conclude(
        &self,
        mut job: Job<'_>,
        result: Result<Step, CoreError>,
        metadata: &mut MetadataMap,
    ) -> Result<TemplateReport, CoreError> {
        let outcome = match result {
            Ok(Step::Skipped(reason)) => Outcome::Skipped { reason },
            Ok(Step::Converted { vmid, record }) => {
                metadata.insert(job.name.clone(), record);
                self.metadata.save(metadata)?;
                info!("[{}] template ready as {vmid}", job.name);
                Outcome::Converted { vmid }
            }
            Err(e) => {
                let stage = job.state;
                error!("[{}] failed during {stage}: {e}", job.name);
                self.cleanup(&mut job);
                job.finish(TemplateState::Failed);
                Outcome::Failed {
                    stage,
                    error: e.to_string(),
                }
            }
        };
        Ok(TemplateReport {
            name: job.name,
            outcome,
        })
    }

    /// Best-effort removal of everything this run created for the job.
    fn cleanup(&self, job: &mut Job<'_>) {
        for vmid in job.created.drain(..).rev() {
            match self.platform.destroy(vmid) {
                Ok(()) => info!("[{}] cleaned up vmid {vmid}", job.name),
                Err(e) => warn!("[{}] cleanup of vmid {vmid} failed: {e}", job.name),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps() {
        let prev = BuildMetadata {
            vmid: Some(9000),
            build_date: Some("2024-01-01T00:00:00Z".to_owned()),
            last_update: Some("2024-02-01T00:00:00Z".to_owned()),
        };
        let now = "2025-01-01T00:00:00Z";

        let built = Stamp::Built.apply(Some(&prev), now);
        assert_eq!(built.build_date.as_deref(), Some(now));
        assert_eq!(built.last_update, prev.last_update);

        let updated = Stamp::Updated.apply(Some(&prev), now);
        assert_eq!(updated.build_date, prev.build_date);
        assert_eq!(updated.last_update.as_deref(), Some(now));

        let rebuilt = Stamp::Rebuilt.apply(None, now);
        assert_eq!(rebuilt.build_date.as_deref(), Some(now));
        assert_eq!(rebuilt.last_update.as_deref(), Some(now));
        assert_eq!(rebuilt.vmid, None);
    }

    #[test]
    fn report_counts() {
        let report = RunReport {
            templates: vec![
                TemplateReport {
                    name: "a".to_owned(),
                    outcome: Outcome::Converted { vmid: 9000 },
                },
                TemplateReport {
                    name: "b".to_owned(),
                    outcome: Outcome::Failed {
                        stage: TemplateState::Customizing,
                        error: "boom".to_owned(),
                    },
                },
            ],
            ..RunReport::default()
        };
        assert_eq!(report.converted(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 0);
        assert!(report.has_failures());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["templates"][0]["outcome"], "converted");
        assert_eq!(json["templates"][1]["stage"], "customizing");
    }
}

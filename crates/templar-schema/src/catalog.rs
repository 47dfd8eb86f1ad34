use crate::types::{validate_template_name, TemplateName};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse catalog JSON: {0}")]
    ParseJson(#[from] serde_json::Error),
    #[error("failed to parse catalog TOML: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid name in catalog: {0}")]
    InvalidName(String),
    #[error("template '{template}' references unknown component '{component}'")]
    UnknownComponent { template: String, component: String },
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),
    #[error("template '{0}' has an empty image_url")]
    EmptyImageUrl(String),
    #[error("'{owner}': copy destination '{destination}' must be an absolute guest directory")]
    InvalidCopyDestination { owner: String, destination: String },
    #[error("template '{0}' is defined both at top level and under 'templates'")]
    DuplicateTemplate(String),
}

/// Serialization format of a catalog file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogFormat {
    Json,
    Toml,
}

impl CatalogFormat {
    /// `.toml` files are TOML, everything else is treated as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            _ => Self::Json,
        }
    }
}

/// Host file copied into a guest directory during customization.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CopyFile {
    pub source: PathBuf,
    pub destination: String,
}

/// Reusable fragment contributing packages, files and commands.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Component {
    #[serde(default)]
    pub install_packages: Vec<String>,
    #[serde(default)]
    pub copy_files: Vec<CopyFile>,
    #[serde(default)]
    pub run_commands: Vec<String>,
}

/// Hardware and access settings applied when the VM resource is created.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VmSettings {
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub firewall: bool,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            cores: default_cores(),
            bridge: default_bridge(),
            ssh_user: None,
            firewall: false,
        }
    }
}

fn default_memory_mb() -> u32 {
    1024
}

fn default_cores() -> u32 {
    1
}

fn default_bridge() -> String {
    "vmbr0".to_owned()
}

/// A template entry as written in the catalog, before composition.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TemplateSpec {
    pub image_url: String,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub install_packages: Vec<String>,
    #[serde(default)]
    pub copy_files: Vec<CopyFile>,
    #[serde(default)]
    pub run_commands: Vec<String>,
    #[serde(default)]
    pub update_packages: bool,
    #[serde(default)]
    pub ssh_password_auth: bool,
    #[serde(default)]
    pub ssh_root_login: bool,
    #[serde(default)]
    pub vm: VmSettings,
}

/// Template catalog.
///
/// Templates are written as top-level `name = definition` entries next to the
/// reserved `components` section. A nested `templates` section is accepted
/// as well, so `components` and `templates` cannot be template names.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "RawCatalog")]
pub struct Catalog {
    #[serde(default)]
    pub components: BTreeMap<String, Component>,
    #[serde(default)]
    pub templates: BTreeMap<String, TemplateSpec>,
    /// Directory that relative `copy_files` sources resolve against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Deserialize)]
struct RawCatalog {
    #[serde(default)]
    components: BTreeMap<String, Component>,
    #[serde(default)]
    templates: BTreeMap<String, TemplateSpec>,
    #[serde(flatten)]
    entries: BTreeMap<String, TemplateSpec>,
}

impl TryFrom<RawCatalog> for Catalog {
    type Error = CatalogError;

    fn try_from(raw: RawCatalog) -> Result<Self, Self::Error> {
        let mut templates = raw.templates;
        for (name, spec) in raw.entries {
            if templates.contains_key(&name) {
                return Err(CatalogError::DuplicateTemplate(name));
            }
            templates.insert(name, spec);
        }
        Ok(Self {
            components: raw.components,
            templates,
            base_dir: None,
        })
    }
}

/// Effective definition of one template after component composition.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TemplateDefinition {
    pub name: TemplateName,
    pub image_url: String,
    pub install_packages: Vec<String>,
    pub copy_files: Vec<CopyFile>,
    pub run_commands: Vec<String>,
    pub update_packages: bool,
    pub ssh_password_auth: bool,
    pub ssh_root_login: bool,
    pub vm: VmSettings,
}

impl Catalog {
    /// Structural checks run once at load time so that a bad catalog is
    /// rejected before anything touches the platform.
    pub fn validate(&self) -> Result<(), CatalogError> {
        for (name, component) in &self.components {
            validate_template_name(name).map_err(CatalogError::InvalidName)?;
            check_destinations(name, &component.copy_files)?;
        }
        for (name, spec) in &self.templates {
            validate_template_name(name).map_err(CatalogError::InvalidName)?;
            if spec.image_url.trim().is_empty() {
                return Err(CatalogError::EmptyImageUrl(name.clone()));
            }
            for component in &spec.components {
                if !self.components.contains_key(component) {
                    return Err(CatalogError::UnknownComponent {
                        template: name.clone(),
                        component: component.clone(),
                    });
                }
            }
            check_destinations(name, &spec.copy_files)?;
        }
        Ok(())
    }

    pub fn template_names(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Compose the effective definition for `name`.
    ///
    /// Components apply in declaration order and the template's own values
    /// are appended last. Packages keep their first occurrence; files and
    /// commands are kept as-is since their order is execution order.
    pub fn resolve(&self, name: &str) -> Result<TemplateDefinition, CatalogError> {
        let spec = self
            .templates
            .get(name)
            .ok_or_else(|| CatalogError::UnknownTemplate(name.to_owned()))?;
        let template_name = TemplateName::new(name).map_err(CatalogError::InvalidName)?;

        let mut packages = Vec::new();
        let mut seen = HashSet::new();
        let mut copy_files = Vec::new();
        let mut run_commands = Vec::new();

        let fragments = spec
            .components
            .iter()
            .map(|c| {
                self.components
                    .get(c)
                    .ok_or_else(|| CatalogError::UnknownComponent {
                        template: name.to_owned(),
                        component: c.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let own = Component {
            install_packages: spec.install_packages.clone(),
            copy_files: spec.copy_files.clone(),
            run_commands: spec.run_commands.clone(),
        };

        for fragment in fragments.into_iter().chain(std::iter::once(&own)) {
            for pkg in &fragment.install_packages {
                if seen.insert(pkg.as_str().to_owned()) {
                    packages.push(pkg.clone());
                }
            }
            for file in &fragment.copy_files {
                copy_files.push(CopyFile {
                    source: self.resolve_host_path(&file.source),
                    destination: file.destination.clone(),
                });
            }
            run_commands.extend(fragment.run_commands.iter().cloned());
        }

        Ok(TemplateDefinition {
            name: template_name,
            image_url: spec.image_url.clone(),
            install_packages: packages,
            copy_files,
            run_commands,
            update_packages: spec.update_packages,
            ssh_password_auth: spec.ssh_password_auth,
            ssh_root_login: spec.ssh_root_login,
            vm: spec.vm.clone(),
        })
    }

    /// Resolve every template in name order.
    pub fn resolve_all(&self) -> Result<Vec<TemplateDefinition>, CatalogError> {
        self.templates.keys().map(|n| self.resolve(n)).collect()
    }

    fn resolve_host_path(&self, source: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if source.is_relative() => base.join(source),
            _ => source.to_path_buf(),
        }
    }
}

fn check_destinations(owner: &str, files: &[CopyFile]) -> Result<(), CatalogError> {
    for file in files {
        if !file.destination.starts_with('/') {
            return Err(CatalogError::InvalidCopyDestination {
                owner: owner.to_owned(),
                destination: file.destination.clone(),
            });
        }
    }
    Ok(())
}

pub fn parse_catalog_str(input: &str, format: CatalogFormat) -> Result<Catalog, CatalogError> {
    let catalog: Catalog = match format {
        CatalogFormat::Json => serde_json::from_str(input)?,
        CatalogFormat::Toml => toml::from_str(input)?,
    };
    catalog.validate()?;
    Ok(catalog)
}

pub fn parse_catalog_file(path: impl AsRef<Path>) -> Result<Catalog, CatalogError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let mut catalog = parse_catalog_str(&content, CatalogFormat::from_path(path))?;
    catalog.base_dir = path.parent().map(Path::to_path_buf);
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "components": {
            "base": {
                "install_packages": ["qemu-guest-agent", "curl"],
                "run_commands": ["systemctl enable qemu-guest-agent"]
            },
            "motd": {
                "install_packages": ["curl", "figlet"],
                "copy_files": [{"source": "files/motd.sh", "destination": "/etc/profile.d"}],
                "run_commands": ["chmod +x /etc/profile.d/motd.sh"]
            }
        },
        "templates": {
            "debian-12": {
                "image_url": "https://cloud.debian.org/images/debian-12-generic-amd64.qcow2",
                "components": ["base", "motd"],
                "install_packages": ["vim", "curl"],
                "run_commands": ["echo done > /etc/templar"],
                "ssh_password_auth": true
            }
        }
    }"#;

    #[test]
    fn flat_catalog_maps_names_to_definitions() {
        let input = r#"{
            "debian-12": {
                "image_url": "https://cloud.debian.org/images/debian-12-generic-amd64.qcow2",
                "run_commands": ["echo hi"],
                "ssh_root_login": false
            },
            "alma-9": {"image_url": "https://repo.almalinux.org/alma-9.qcow2"}
        }"#;
        let catalog = parse_catalog_str(input, CatalogFormat::Json).unwrap();
        assert_eq!(catalog.template_names(), vec!["alma-9", "debian-12"]);
        assert!(catalog.components.is_empty());
        let def = catalog.resolve("debian-12").unwrap();
        assert_eq!(def.run_commands, vec!["echo hi"]);
        assert!(!def.ssh_root_login);
    }

    #[test]
    fn flat_catalog_with_components_section() {
        let input = r#"{
            "components": {"base": {"install_packages": ["qemu-guest-agent"]}},
            "ubuntu-24": {"image_url": "noble.img", "components": ["base"]}
        }"#;
        let catalog = parse_catalog_str(input, CatalogFormat::Json).unwrap();
        let def = catalog.resolve("ubuntu-24").unwrap();
        assert_eq!(def.install_packages, vec!["qemu-guest-agent"]);
    }

    #[test]
    fn flat_catalog_still_validates_names() {
        let input = r#"{"bad name": {"image_url": "x.qcow2"}}"#;
        assert!(matches!(
            parse_catalog_str(input, CatalogFormat::Json),
            Err(CatalogError::InvalidName(_))
        ));
    }

    #[test]
    fn same_template_in_both_places_is_rejected() {
        let input = r#"{
            "templates": {"a": {"image_url": "x.qcow2"}},
            "a": {"image_url": "y.qcow2"}
        }"#;
        let err = parse_catalog_str(input, CatalogFormat::Json).unwrap_err();
        assert!(err.to_string().contains("defined both"), "{err}");
    }

    #[test]
    fn flat_toml_catalog_parses() {
        let input = r#"
[fedora-40]
image_url = "https://download.fedoraproject.org/fedora-40.qcow2"
install_packages = ["vim"]
"#;
        let catalog = parse_catalog_str(input, CatalogFormat::Toml).unwrap();
        assert_eq!(catalog.resolve("fedora-40").unwrap().install_packages, vec!["vim"]);
    }

    #[test]
    fn components_apply_in_order_then_template() {
        let catalog = parse_catalog_str(CATALOG, CatalogFormat::Json).unwrap();
        let def = catalog.resolve("debian-12").unwrap();
        assert_eq!(
            def.install_packages,
            vec!["qemu-guest-agent", "curl", "figlet", "vim"]
        );
        assert_eq!(
            def.run_commands,
            vec![
                "systemctl enable qemu-guest-agent",
                "chmod +x /etc/profile.d/motd.sh",
                "echo done > /etc/templar",
            ]
        );
        assert_eq!(def.copy_files.len(), 1);
        assert!(def.ssh_password_auth);
        assert!(!def.ssh_root_login);
        assert_eq!(def.vm, VmSettings::default());
    }

    #[test]
    fn relative_copy_sources_follow_base_dir() {
        let mut catalog = parse_catalog_str(CATALOG, CatalogFormat::Json).unwrap();
        catalog.base_dir = Some(PathBuf::from("/srv/templar"));
        let def = catalog.resolve("debian-12").unwrap();
        assert_eq!(
            def.copy_files[0].source,
            PathBuf::from("/srv/templar/files/motd.sh")
        );
    }

    #[test]
    fn unknown_component_is_rejected_at_load() {
        let input = r#"{"templates": {"a": {"image_url": "x.qcow2", "components": ["nope"]}}}"#;
        let err = parse_catalog_str(input, CatalogFormat::Json).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownComponent { .. }));
    }

    #[test]
    fn invalid_template_name_is_rejected() {
        let input = r#"{"templates": {"bad name": {"image_url": "x.qcow2"}}}"#;
        assert!(matches!(
            parse_catalog_str(input, CatalogFormat::Json),
            Err(CatalogError::InvalidName(_))
        ));
    }

    #[test]
    fn relative_copy_destination_is_rejected() {
        let input = r#"{"templates": {"a": {"image_url": "x.qcow2",
            "copy_files": [{"source": "f", "destination": "etc"}]}}}"#;
        assert!(matches!(
            parse_catalog_str(input, CatalogFormat::Json),
            Err(CatalogError::InvalidCopyDestination { .. })
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let input = r#"{"templates": {"a": {"image_url": "x.qcow2", "packages": []}}}"#;
        assert!(parse_catalog_str(input, CatalogFormat::Json).is_err());
    }

    #[test]
    fn toml_catalog_parses_with_vm_settings() {
        let input = r#"
[templates.rocky-9]
image_url = "https://dl.rockylinux.org/rocky-9.qcow2"
update_packages = true

[templates.rocky-9.vm]
memory_mb = 2048
ssh_user = "rocky"
firewall = true
"#;
        let catalog = parse_catalog_str(input, CatalogFormat::Toml).unwrap();
        let def = catalog.resolve("rocky-9").unwrap();
        assert!(def.update_packages);
        assert_eq!(def.vm.memory_mb, 2048);
        assert_eq!(def.vm.bridge, "vmbr0");
        assert_eq!(def.vm.ssh_user.as_deref(), Some("rocky"));
    }

    #[test]
    fn resolve_unknown_template_errors() {
        let catalog = parse_catalog_str(CATALOG, CatalogFormat::Json).unwrap();
        assert!(matches!(
            catalog.resolve("arch"),
            Err(CatalogError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(
            CatalogFormat::from_path(Path::new("templates.toml")),
            CatalogFormat::Toml
        );
        assert_eq!(
            CatalogFormat::from_path(Path::new("templates.json")),
            CatalogFormat::Json
        );
    }
}

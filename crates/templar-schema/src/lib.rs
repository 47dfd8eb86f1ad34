//! Template catalog and import manifests for Templar.
//!
//! This crate defines the schema layer: catalog parsing (`Catalog`) with
//! component composition into effective `TemplateDefinition`s, template name
//! validation (`TemplateName`), and the import manifest format
//! (`ImportManifest`) including source resolution and directory scanning.

pub mod catalog;
pub mod manifest;
pub mod types;

pub use catalog::{
    parse_catalog_file, parse_catalog_str, Catalog, CatalogError, CatalogFormat, Component,
    CopyFile, TemplateDefinition, TemplateSpec, VmSettings,
};
pub use manifest::{
    generate_manifest, parse_import_manifest_file, parse_import_manifest_str, ImageSource,
    ImportManifest, ManifestEntry, ManifestError, ManifestOrigin, IMAGE_EXTENSIONS,
};
pub use types::{validate_template_name, TemplateName, MAX_TEMPLATE_NAME_LEN};

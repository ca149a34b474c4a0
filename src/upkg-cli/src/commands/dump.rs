//! Resolve objects and print their properties

use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use upkg::{ClassRegistry, LoadSession, LoaderConfig, Object, ObjectData, PackageRegistry};

use super::open;

fn object_json(object: &Object) -> Value {
    let data = match &*object.data() {
        ObjectData::Properties(props) => json!({ "properties": props }),
        ObjectData::Placeholder(region) => json!({
            "placeholder": { "offset": region.offset(), "size": region.size() }
        }),
        ObjectData::Native(native) => json!({ "native": format!("{native:?}") }),
        ObjectData::Pending => json!({ "pending": true }),
    };
    json!({
        "path": object.path(),
        "class": object.class_name(),
        "data": data,
    })
}

pub fn handle(config: LoaderConfig, path: &Path, object: Option<&str>) -> Result<()> {
    let registry = Arc::new(PackageRegistry::new(config)?);
    let package = open(&registry, path)?;
    let mut session = LoadSession::new(registry.clone(), Arc::new(ClassRegistry::tagged_fallback()));

    let objects = match object {
        Some(name) => match session.load_object(&package, name)? {
            Some(object) => vec![object],
            None => bail!("No export named {name} in {}", path.display()),
        },
        None => session.load_all_exports(&package)?,
    };

    let dump: Vec<Value> = objects.iter().map(|o| object_json(o)).collect();
    println!("{}", serde_json::to_string_pretty(&dump)?);

    for warning in session.warnings() {
        eprintln!("Warning: {warning}");
    }
    Ok(())
}

//! Catalog of known simulator controls, loaded from the per-module JSON
//! documents shipped by each simulator's export layer: a module-name ->
//! category-name -> element-name tree, queried by case-insensitive
//! identifier or by (module, category, search term).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// A single named input or output element of a simulator module (an
/// aircraft switch, gauge, or indicator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IOElement {
    pub name: String,
    pub module: String,
    pub category: String,
    #[serde(default)]
    pub inputs: Vec<Input>,
    #[serde(default)]
    pub outputs: Vec<Output>,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub element_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    #[serde(default)]
    pub description: String,
    pub interface: String,
    #[serde(default)]
    pub max_value: i32,
    #[serde(default)]
    pub argument: String,
}

/// An output's wire location plus its interpretation.
///
/// Every output carries `address`; `type` determines which of the
/// integer-only or string-only fields apply, matching the source
/// document's flat-but-tagged shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub address: u16,
    #[serde(default)]
    pub mask: u16,
    #[serde(default)]
    pub max_length: u16,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub max_value: u16,
    #[serde(default)]
    pub shift_by: u16,
    #[serde(default)]
    pub suffix: String,
    #[serde(rename = "type")]
    pub output_type: String,
}

/// Which interpretation an [`Output`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Integer,
    String,
}

/// Resolved view of an integer-valued output, ready for mask/shift math.
#[derive(Debug, Clone, Copy)]
pub struct IntegerOutput {
    pub address: u16,
    pub mask: u16,
    pub shift: u16,
    pub max_value: u16,
}

/// Resolved view of a string-valued output.
#[derive(Debug, Clone, Copy)]
pub struct StringOutput {
    pub address: u16,
    pub max_length: u16,
}

impl Output {
    pub fn kind(&self) -> Option<OutputKind> {
        match self.output_type.as_str() {
            "integer" => Some(OutputKind::Integer),
            "string" => Some(OutputKind::String),
            _ => None,
        }
    }
}

type CategoryMap = BTreeMap<String, BTreeMap<String, IOElement>>;

/// In-memory catalog of loaded modules, queryable by identifier or by
/// (module, category, search term).
pub struct ControlReferenceStore {
    modules: RwLock<BTreeMap<String, CategoryMap>>,
}

impl ControlReferenceStore {
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load a module definition from `module_name.json`, keyed by the file's
    /// stem. Returns an error if the module is already loaded or the file
    /// cannot be parsed.
    pub fn load_file(&self, path: &Path) -> anyhow::Result<()> {
        let module_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow::anyhow!("control reference path has no file stem: {path:?}"))?
            .to_string();

        {
            let modules = self.modules.read().expect("control reference lock poisoned");
            if modules.contains_key(&module_name) {
                anyhow::bail!("control reference: module already loaded: {module_name}");
            }
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("error loading module {module_name}: {e}"))?;
        let mut parsed: CategoryMap = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("error loading module {module_name}: {e}"))?;

        for (category_name, elements) in parsed.iter_mut() {
            for (element_name, elem) in elements.iter_mut() {
                elem.name = element_name.clone();
                elem.module = module_name.clone();
                elem.category = category_name.clone();

                let int_outputs = elem.outputs.iter().filter(|o| o.kind() == Some(OutputKind::Integer)).count();
                let str_outputs = elem.outputs.iter().filter(|o| o.kind() == Some(OutputKind::String)).count();
                if int_outputs > 1 || str_outputs > 1 {
                    log::warn!(
                        "control reference element with more than one integer or string output: {module_name}/{category_name}/{element_name}"
                    );
                }
            }
        }

        self.modules
            .write()
            .expect("control reference lock poisoned")
            .insert(module_name, parsed);
        Ok(())
    }

    /// Drop a loaded module from the catalog.
    pub fn unload_module(&self, module_name: &str) {
        self.modules.write().expect("control reference lock poisoned").remove(module_name);
    }

    /// Module name -> sorted category names, for the `control_reference_get_modules` API call.
    pub fn modules_and_categories(&self) -> BTreeMap<String, Vec<String>> {
        self.modules
            .read()
            .expect("control reference lock poisoned")
            .iter()
            .map(|(module, categories)| (module.clone(), categories.keys().cloned().collect()))
            .collect()
    }

    /// Query elements of `module`, either by exact `category` or, when
    /// `category` is empty, by a case-insensitive substring match against
    /// name/description.
    pub fn query(&self, module: &str, category: &str, search_term: &str) -> Vec<IOElement> {
        let modules = self.modules.read().expect("control reference lock poisoned");
        let Some(categories) = modules.get(module) else {
            return Vec::new();
        };

        if category.is_empty() {
            let needle = search_term.to_lowercase();
            categories
                .values()
                .flat_map(|elems| elems.values())
                .filter(|e| e.name.to_lowercase().contains(&needle) || e.description.to_lowercase().contains(&needle))
                .cloned()
                .collect()
        } else {
            categories
                .get(category)
                .map(|elems| elems.values().cloned().collect())
                .unwrap_or_default()
        }
    }

    /// Resolve `module/element_name`, case-insensitively, to its element.
    pub fn find(&self, identifier: &str) -> Option<IOElement> {
        let (module_id, element_id) = identifier.split_once('/')?;
        let modules = self.modules.read().expect("control reference lock poisoned");
        for (module_name, categories) in modules.iter() {
            if !module_name.eq_ignore_ascii_case(module_id) {
                continue;
            }
            for elements in categories.values() {
                for (name, elem) in elements {
                    if name.eq_ignore_ascii_case(element_id) {
                        return Some(elem.clone());
                    }
                }
            }
        }
        None
    }

    /// The resolved integer output of `module/element_name`, if it has one.
    pub fn integer_output(&self, identifier: &str) -> Option<IntegerOutput> {
        let elem = self.find(identifier)?;
        let out = elem.outputs.iter().find(|o| o.kind() == Some(OutputKind::Integer))?;
        Some(IntegerOutput {
            address: out.address,
            mask: out.mask,
            shift: out.shift_by,
            max_value: out.max_value,
        })
    }

    /// The resolved string output of `module/element_name`, if it has one.
    pub fn string_output(&self, identifier: &str) -> Option<StringOutput> {
        let elem = self.find(identifier)?;
        let out = elem.outputs.iter().find(|o| o.kind() == Some(OutputKind::String))?;
        Some(StringOutput {
            address: out.address,
            max_length: out.max_length,
        })
    }
}

impl Default for ControlReferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_module(dir: &Path, name: &str, json: &str) -> std::path::PathBuf {
        let path = dir.join(format!("{name}.json"));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(json.as_bytes()).unwrap();
        path
    }

    #[test]
    fn load_and_find_case_insensitive() {
        let dir = std::env::temp_dir().join(format!("controlref-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_module(
            &dir,
            "TestJet",
            r#"{
                "switches": {
                    "MASTER_ARM": {
                        "description": "master arm switch",
                        "outputs": [
                            {"address": 10, "mask": 3, "shift_by": 0, "max_value": 2, "type": "integer"}
                        ]
                    }
                }
            }"#,
        );

        let store = ControlReferenceStore::new();
        store.load_file(&path).unwrap();

        let elem = store.find("testjet/master_arm").expect("found");
        assert_eq!(elem.module, "TestJet");
        assert_eq!(elem.category, "switches");

        let out = store.integer_output("TESTJET/MASTER_ARM").expect("integer output");
        assert_eq!(out.address, 10);
        assert_eq!(out.max_value, 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_file_twice_errors() {
        let dir = std::env::temp_dir().join(format!("controlref-test-dup-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_module(&dir, "Dup", r#"{"cat": {}}"#);

        let store = ControlReferenceStore::new();
        store.load_file(&path).unwrap();
        assert!(store.load_file(&path).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn query_by_search_term() {
        let dir = std::env::temp_dir().join(format!("controlref-test-search-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_module(
            &dir,
            "Search",
            r#"{
                "cat": {
                    "FLAPS_LEVER": {"description": "flaps lever control", "outputs": []},
                    "GEAR_LEVER": {"description": "gear lever control", "outputs": []}
                }
            }"#,
        );

        let store = ControlReferenceStore::new();
        store.load_file(&path).unwrap();

        let results = store.query("Search", "", "flaps");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "FLAPS_LEVER");

        std::fs::remove_dir_all(&dir).ok();
    }
}

//! Composite-definitions XML loader (spec.md §6 "Configuration document").
//!
//! The document is read once at startup and turned into an immutable
//! `id -> CompositeDef` dispatch table; composite definitions never change
//! for the worker's lifetime (spec.md §3 "Lifecycles"), so there's no
//! reload path here.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use quick_xml::events::Event;
use quick_xml::reader::Reader;

#[derive(Debug, Clone)]
pub struct ScanDef {
    pub id: String,
    pub oid: String,
    pub var: String,
    pub exclude_only: bool,
}

#[derive(Debug, Clone)]
pub struct FctnDef {
    pub name: String,
    pub value: Option<String>,
    pub with: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ValDef {
    pub id: String,
    pub var: Option<String>,
    pub oid: Option<String>,
    pub is_rate: bool,
    pub fctns: Vec<FctnDef>,
}

#[derive(Debug, Clone)]
pub struct InputDef {
    pub id: String,
    pub required: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceDef {
    pub scans: Vec<ScanDef>,
    pub vals: Vec<ValDef>,
    pub inputs: Vec<InputDef>,
}

#[derive(Debug, Clone)]
pub struct CompositeDef {
    pub id: String,
    pub description: Option<String>,
    pub instances: BTreeMap<String, InstanceDef>,
}

impl CompositeDef {
    /// §3 "instances[hostType] — for this spec only `default` is required."
    pub fn instance(&self, host_type: &str) -> Option<&InstanceDef> {
        self.instances
            .get(host_type)
            .or_else(|| self.instances.get("default"))
    }
}

pub type CompositeRegistry = BTreeMap<String, CompositeDef>;

pub fn load_composites(path: impl AsRef<Path>) -> Result<CompositeRegistry> {
    let path = path.as_ref();
    let xml = std::fs::read_to_string(path)
        .with_context(|| format!("reading composite config {}", path.display()))?;
    parse_composites(&xml).with_context(|| format!("parsing composite config {}", path.display()))
}

fn attr(e: &quick_xml::events::BytesStart, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name.as_bytes())
        .map(|a| a.unescape_value().unwrap_or_default().into_owned())
}

fn attr_bool(e: &quick_xml::events::BytesStart, name: &str) -> bool {
    attr(e, name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Parse the `/config/composite[...]/instance[...]/{scan,result/val,input}`
/// document shape from spec.md §6 into a registry keyed by composite id.
pub fn parse_composites(xml: &str) -> Result<CompositeRegistry> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut registry = CompositeRegistry::new();
    let mut cur_composite: Option<CompositeDef> = None;
    let mut cur_instance_key: Option<String> = None;
    let mut cur_instance: Option<InstanceDef> = None;
    let mut cur_val: Option<ValDef> = None;
    let mut in_result = false;

    let mut buf = Vec::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .context("malformed composite XML")?
        {
            Event::Eof => break,
            Event::Start(e) => {
                match e.name().as_ref() {
                    b"composite" => {
                        let id = attr(&e, "id").context("<composite> missing id")?;
                        cur_composite = Some(CompositeDef {
                            id,
                            description: attr(&e, "description"),
                            instances: BTreeMap::new(),
                        });
                    }
                    b"instance" => {
                        let host_type =
                            attr(&e, "hostType").unwrap_or_else(|| "default".to_string());
                        cur_instance_key = Some(host_type);
                        cur_instance = Some(InstanceDef::default());
                    }
                    b"result" => {
                        in_result = true;
                    }
                    b"val" => {
                        cur_val = Some(ValDef {
                            id: attr(&e, "id").context("<val> missing id")?,
                            var: attr(&e, "var"),
                            oid: attr(&e, "oid"),
                            is_rate: attr(&e, "type").as_deref() == Some("rate"),
                            fctns: Vec::new(),
                        });
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => {
                match e.name().as_ref() {
                    b"scan" => {
                        if let Some(inst) = cur_instance.as_mut() {
                            inst.scans.push(ScanDef {
                                id: attr(&e, "id").context("<scan> missing id")?,
                                oid: attr(&e, "oid").context("<scan> missing oid")?,
                                var: attr(&e, "var").context("<scan> missing var")?,
                                exclude_only: attr_bool(&e, "exclude-only"),
                            });
                        }
                    }
                    b"val" => {
                        if let Some(inst) = cur_instance.as_mut() {
                            if in_result {
                                inst.vals.push(ValDef {
                                    id: attr(&e, "id").context("<val> missing id")?,
                                    var: attr(&e, "var"),
                                    oid: attr(&e, "oid"),
                                    is_rate: attr(&e, "type").as_deref() == Some("rate"),
                                    fctns: Vec::new(),
                                });
                            }
                        }
                    }
                    b"fctn" => {
                        if let Some(val) = cur_val.as_mut() {
                            val.fctns.push(FctnDef {
                                name: attr(&e, "name").context("<fctn> missing name")?,
                                value: attr(&e, "value"),
                                with: attr(&e, "with"),
                            });
                        }
                    }
                    b"input" => {
                        if let Some(inst) = cur_instance.as_mut() {
                            inst.inputs.push(InputDef {
                                id: attr(&e, "id").context("<input> missing id")?,
                                required: attr_bool(&e, "required"),
                            });
                        }
                    }
                    _ => {}
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"val" => {
                    if let (Some(inst), Some(val)) = (cur_instance.as_mut(), cur_val.take()) {
                        if in_result {
                            inst.vals.push(val);
                        }
                    }
                }
                b"result" => {
                    in_result = false;
                }
                b"instance" => {
                    if let (Some(composite), Some(key), Some(inst)) = (
                        cur_composite.as_mut(),
                        cur_instance_key.take(),
                        cur_instance.take(),
                    ) {
                        composite.instances.insert(key, inst);
                    }
                }
                b"composite" => {
                    if let Some(composite) = cur_composite.take() {
                        registry.insert(composite.id.clone(), composite);
                    }
                }
                _ => {}
            },
            _ => {}
        }
        buf.clear();
    }

    if registry.is_empty() {
        bail!("no <composite> elements found in config");
    }
    Ok(registry)
}

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;

use binrw::BinRead;

use crate::error::Result;
use crate::helpers::utf16_nts;
use crate::nettrace::Blob;

/// Payload of `Microsoft-Windows-DotNETRuntimeRundown` event 144
/// (MethodDCEndVerbose).
#[derive(BinRead, Debug, Clone)]
#[br(little)]
pub struct MethodRecord {
    pub method_id: i64,
    pub module_id: i64,
    pub start_address: u64,
    pub size: i32,
    pub token: i32,
    pub flags: i32,
    #[br(parse_with = utf16_nts)]
    pub namespace: String,
    #[br(parse_with = utf16_nts)]
    pub name: String,
    #[br(parse_with = utf16_nts)]
    pub signature: String,
}

impl MethodRecord {
    // perfview renders methods as namespace.name + the parenthesized part of
    // the signature; the return type and calling convention are dropped.
    fn display(&self) -> String {
        let signature = match self.signature.find('(') {
            Some(p) => &self.signature[p..],
            None => self.signature.as_str(),
        };
        format!("{}.{}{}", self.namespace, self.name, signature)
    }
}

/// Payload of `Microsoft-Windows-DotNETRuntimeRundown` event 152
/// (ModuleDCEnd). Twelve reserved bytes sit between the flags and the IL
/// path.
#[derive(BinRead, Debug, Clone)]
#[br(little)]
pub struct ModuleRecord {
    pub module_id: i64,
    pub assembly_id: i64,
    pub flags: i32,
    #[br(pad_before = 12, parse_with = utf16_nts)]
    pub il_path: String,
}

impl ModuleRecord {
    fn display(&self) -> String {
        Path::new(&self.il_path)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Method and module tables built from rundown events, with the derived
/// lookup state: a lazily sorted vector of method start addresses and
/// per-address resolution caches.
#[derive(Debug, Default)]
pub(crate) struct Symbols {
    methods: HashMap<u64, MethodRecord>,
    modules: HashMap<i64, ModuleRecord>,
    starts: Vec<u64>,
    sorted: bool,
    address_cache: HashMap<u64, u64>,
    name_cache: HashMap<u64, String>,
}

pub(crate) const UNKNOWN_FRAME: &str = "?!?";

impl Symbols {
    pub fn add_method(&mut self, blob: &Blob<'_>) -> Result<()> {
        let method = MethodRecord::read(&mut Cursor::new(blob.payload))?;
        self.starts.push(method.start_address);
        self.methods.insert(method.start_address, method);
        self.sorted = false;
        Ok(())
    }

    pub fn add_module(&mut self, blob: &Blob<'_>) -> Result<()> {
        let module = ModuleRecord::read(&mut Cursor::new(blob.payload))?;
        self.modules.insert(module.module_id, module);
        Ok(())
    }

    /// Maps an instruction pointer to the start address of the containing
    /// method: the greatest recorded start at or below `addr`, accepted only
    /// if `addr` falls within the method's size.
    pub fn resolve_address(&mut self, addr: u64) -> Option<u64> {
        if let Some(&start) = self.address_cache.get(&addr) {
            return Some(start);
        }
        if !self.sorted {
            self.starts.sort_unstable();
            self.starts.dedup();
            self.sorted = true;
        }
        let idx = self.starts.partition_point(|&start| start <= addr);
        if idx == 0 {
            return None;
        }
        let start = self.starts[idx - 1];
        let method = self.methods.get(&start)?;
        if addr >= start.wrapping_add(method.size as u64) {
            return None;
        }
        self.address_cache.insert(addr, start);
        Some(start)
    }

    /// Renders the method at `start` as `module!namespace.name(signature)`.
    /// An unknown module renders as `?!method`; an unknown start address as
    /// `?!?`.
    pub fn resolve_string(&mut self, start: u64) -> String {
        if let Some(name) = self.name_cache.get(&start) {
            return name.clone();
        }
        let Some(method) = self.methods.get(&start) else {
            return UNKNOWN_FRAME.to_string();
        };
        let name = match self.modules.get(&method.module_id) {
            Some(module) => format!("{}!{}", module.display(), method.display()),
            None => format!("?!{}", method.display()),
        };
        self.name_cache.insert(start, name.clone());
        name
    }
}

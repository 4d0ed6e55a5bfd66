//! Turning code addresses into human labels.
//!
//! Object files announced by `TEXT_AVMA` records are loaded along with
//! their DWARF line information (following a `.gnu_debuglink` sibling when
//! the object carries one), and addresses resolve to
//! `0xADDR in function (file:line)`, degrading to the bare hex address when
//! nothing better is known.

use addr2line::Context;
use dgwire::HWord;
use gimli::{EndianRcSlice, RunTimeEndian};
use log::warn;
use object::{Object, ObjectSection};
use rustc_demangle::demangle;
use std::{borrow::Cow, collections::BTreeMap, error::Error, fs, path::Path, rc::Rc};

type DwarfCtx = Context<EndianRcSlice<RunTimeEndian>>;

struct ObjectEntry {
    text_avma: HWord,
    /// Runtime load bias: `text_avma` minus the link-time `.text` address.
    bias: u64,
    ctx: Option<DwarfCtx>,
}

pub struct SymbolTable {
    objects: BTreeMap<String, ObjectEntry>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
        }
    }

    pub fn n_objects(&self) -> usize {
        self.objects.len()
    }

    /// Registers an object file mapped with its `.text` at `text_avma`.
    /// Re-registering a file replaces the previous mapping.
    pub fn register(&mut self, filename: &str, text_avma: HWord) {
        let (ctx, bias) = match load_object(filename, text_avma) {
            Ok(x) => x,
            Err(e) => {
                warn!("no debug info for `{filename}': {e}");
                (None, 0)
            }
        };
        self.objects.insert(
            filename.to_owned(),
            ObjectEntry {
                text_avma,
                bias,
                ctx,
            },
        );
    }

    /// Renders `addr` as `0xADDR [in function] ([file:line])`.
    pub fn resolve(&self, addr: HWord) -> String {
        let mut label = format!("{addr:#x}");
        for (filename, obj) in &self.objects {
            if addr < obj.text_avma {
                continue;
            }
            let Some(ctx) = &obj.ctx else {
                continue;
            };
            let probe = (addr as u64).wrapping_sub(obj.bias);
            let Ok(mut frames) = ctx.find_frames(probe).skip_all_loads() else {
                continue;
            };
            let Ok(Some(frame)) = frames.next() else {
                continue;
            };

            if let Some(func) = &frame.function {
                if let Ok(name) = func.raw_name() {
                    label.push_str(&format!(" in {:#}", demangle(&name)));
                }
            }
            label.push_str(" (");
            match &frame.location {
                Some(loc) if loc.file.is_some() => {
                    let file = loc.file.unwrap();
                    label.push_str(file.rsplit('/').next().unwrap_or(file));
                    if let Some(line) = loc.line {
                        label.push_str(&format!(":{line}"));
                    }
                }
                _ => label.push_str(filename),
            }
            label.push(')');
            return label;
        }
        label
    }
}

/// Loads DWARF line info for `filename`, preferring a `.gnu_debuglink`
/// sibling (looked up next to the object) when one is advertised.
fn load_object(
    filename: &str,
    text_avma: HWord,
) -> Result<(Option<DwarfCtx>, u64), Box<dyn Error>> {
    let data = fs::read(filename)?;
    let obj = object::File::parse(&*data)?;
    let link_text = obj
        .section_by_name(".text")
        .map(|s| s.address())
        .unwrap_or(0);
    let bias = (text_avma as u64).wrapping_sub(link_text);

    if let Ok(Some((name, _crc))) = obj.gnu_debuglink() {
        let sibling = Path::new(filename)
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(String::from_utf8_lossy(name).as_ref());
        if let Ok(debug_data) = fs::read(&sibling) {
            if let Ok(debug_obj) = object::File::parse(&*debug_data) {
                if let Ok(ctx) = dwarf_context(&debug_obj) {
                    return Ok((Some(ctx), bias));
                }
            }
        }
    }

    Ok((Some(dwarf_context(&obj)?), bias))
}

fn dwarf_context(obj: &object::File) -> Result<DwarfCtx, Box<dyn Error>> {
    let endian = if obj.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };
    let load_section = |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
        let data = obj
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[][..]));
        Ok(EndianRcSlice::new(Rc::from(&*data), endian))
    };
    let dwarf = gimli::Dwarf::load(&load_section)?;
    Ok(Context::from_dwarf(dwarf)?)
}

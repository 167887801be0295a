//! Bit-packed wire codec.
//!
//! Packs template fields as contiguous big-endian bit-fields in
//! declaration order: at the position of the repeated-field group the
//! whole section block goes out `N_ITER` times, trailing fields (the
//! end-section block) follow it, and declared sub-packets close the
//! stream. The decoder mirrors this with two alignment rules: it
//! advances to the next byte boundary before the section block and
//! before each sub-packet lookahead, where it peeks an 8-bit candidate
//! `NID_PACKET` and skips the slot on mismatch.
//!
//! Encode errors are caller bugs and propagate; a short stream on
//! decode stops with whatever was read so far.

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::CodecError;
use crate::message::{as_u64, Fields};
use crate::templates::{FieldSpec, Template, TemplateSet};

// ── Bit-level buffers ────────────────────────────────────────────────

#[derive(Default)]
pub struct BitWriter {
    buf: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: u64, bits: u8) {
        debug_assert!(bits >= 1 && bits <= 64);
        for i in (0..bits).rev() {
            let bit = (value >> i) & 1;
            let slot = self.bit_len % 8;
            if slot == 0 {
                self.buf.push(0);
            }
            if bit == 1 {
                let last = self.buf.len() - 1;
                self.buf[last] |= 1 << (7 - slot);
            }
            self.bit_len += 1;
        }
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

pub struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() * 8 - self.pos
    }

    pub fn read(&mut self, bits: u8) -> Option<u64> {
        if self.remaining() < bits as usize {
            return None;
        }
        let mut v: u64 = 0;
        for _ in 0..bits {
            let byte = self.buf[self.pos / 8];
            let bit = (byte >> (7 - (self.pos % 8))) & 1;
            v = (v << 1) | bit as u64;
            self.pos += 1;
        }
        Some(v)
    }

    /// 8-bit lookahead without consuming.
    pub fn peek8(&self) -> Option<u8> {
        let mut probe = BitReader { buf: self.buf, pos: self.pos };
        probe.read(8).map(|v| v as u8)
    }

    pub fn align_to_byte(&mut self) {
        let rem = self.pos % 8;
        if rem != 0 {
            self.pos += 8 - rem;
        }
    }
}

// ── Pack ─────────────────────────────────────────────────────────────

pub fn pack(template: &Template, values: &Fields, reg: &TemplateSet) -> Result<Vec<u8>, CodecError> {
    let mut w = BitWriter::new();
    pack_into(&mut w, template, values, reg)?;
    Ok(w.into_bytes())
}

fn pack_into(
    w: &mut BitWriter,
    template: &Template,
    values: &Fields,
    reg: &TemplateSet,
) -> Result<(), CodecError> {
    let n_iter = if template.declares("N_ITER") {
        values.get("N_ITER").map(field_as_u64).transpose()?.unwrap_or(0)
    } else {
        0
    };

    let mut section_block_done = false;
    for fs in template.fields {
        if !fs.repeated {
            let v = field_value(values, fs)?;
            push_checked(w, v, fs)?;
            continue;
        }
        // The whole section block goes out at the first repeated field.
        if section_block_done || n_iter == 0 {
            section_block_done = true;
            continue;
        }
        section_block_done = true;
        let empty = Vec::new();
        let sections = values.get("sections").and_then(Value::as_array).unwrap_or(&empty);
        for i in 0..n_iter as usize {
            let sec = sections.get(i).and_then(Value::as_object);
            for rf in template.fields.iter().filter(|rf| rf.repeated) {
                let key = section_key(rf.name);
                let v = match sec.and_then(|s| s.get(key)) {
                    Some(v) => field_as_u64(v).map_err(|_| CodecError::OutOfRange {
                        field: key.to_string(),
                        bits: rf.bits,
                    })?,
                    None => 0,
                };
                push_checked(w, v, rf)?;
            }
        }
    }

    for &name in template.sub_packets {
        if let Some(Value::Object(sub)) = values.get(name) {
            match reg.packet(name) {
                Some(pt) => pack_into(w, pt, sub, reg)?,
                None => warn!("no packet template for declared sub-packet {name}"),
            }
        }
    }
    Ok(())
}

fn field_value(values: &Fields, fs: &FieldSpec) -> Result<u64, CodecError> {
    match values.get(fs.name) {
        None | Some(Value::Null) => Ok(0),
        Some(v) => as_u64(v).ok_or_else(|| CodecError::OutOfRange {
            field: fs.name.to_string(),
            bits: fs.bits,
        }),
    }
}

fn field_as_u64(v: &Value) -> Result<u64, CodecError> {
    as_u64(v).ok_or_else(|| CodecError::OutOfRange { field: "N_ITER".into(), bits: 64 })
}

fn push_checked(w: &mut BitWriter, v: u64, fs: &FieldSpec) -> Result<(), CodecError> {
    if fs.bits < 64 && v > (1u64 << fs.bits) - 1 {
        return Err(CodecError::OutOfRange { field: fs.name.to_string(), bits: fs.bits });
    }
    w.push(v, fs.bits);
    Ok(())
}

fn section_key(name: &str) -> &str {
    name.strip_suffix("_k").unwrap_or(name)
}

// ── Unpack ───────────────────────────────────────────────────────────

/// Decode `bytes` against `template`. A short stream is a warning, not
/// an error: decoding stops and whatever was read so far is returned.
pub fn unpack(template: &Template, bytes: &[u8], reg: &TemplateSet) -> Fields {
    let mut r = BitReader::new(bytes);
    unpack_from(&mut r, template, reg)
}

fn unpack_from(r: &mut BitReader<'_>, template: &Template, reg: &TemplateSet) -> Fields {
    let mut out = Fields::new();

    let mut section_block_done = false;
    for fs in template.fields {
        if !fs.repeated {
            match r.read(fs.bits) {
                Some(v) => {
                    out.insert(fs.name.into(), Value::from(v));
                }
                None => {
                    warn!(field = fs.name, template = template.name, "bit stream exhausted, partial decode");
                    return out;
                }
            }
            continue;
        }
        if section_block_done {
            continue;
        }
        section_block_done = true;
        let n_iter = out.get("N_ITER").and_then(as_u64).unwrap_or(0);
        if n_iter == 0 {
            continue;
        }
        r.align_to_byte();
        let mut sections: Vec<Value> = Vec::with_capacity(n_iter as usize);
        for _ in 0..n_iter {
            let mut sec = Fields::new();
            for rf in template.fields.iter().filter(|rf| rf.repeated) {
                match r.read(rf.bits) {
                    Some(v) => {
                        sec.insert(section_key(rf.name).into(), Value::from(v));
                    }
                    None => {
                        warn!(template = template.name, "bit stream exhausted inside section block");
                        out.insert("sections".into(), Value::Array(sections));
                        return out;
                    }
                }
            }
            sections.push(Value::Object(sec));
        }
        out.insert("sections".into(), Value::Array(sections));
    }

    for &name in template.sub_packets {
        let Some(pt) = reg.packet(name) else { continue };
        r.align_to_byte();
        let Some(candidate) = r.peek8() else {
            debug!(template = template.name, "no bits left for sub-packet {name}");
            break;
        };
        if Some(candidate as u64) == pt.expected_nid_packet() {
            let sub = unpack_from(r, pt, reg);
            out.insert(name.into(), Value::Object(sub));
        } else {
            warn!(
                template = template.name,
                candidate, "NID_PACKET mismatch for sub-packet slot {name}, skipping"
            );
        }
    }

    out
}

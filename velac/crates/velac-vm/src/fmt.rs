//! The printf/scanf family.
//!
//! The generator lowers each call into one `CALL_BUILTIN` per argument plus
//! a final flush, over a stack window of `[count, stream, format, value]`.
//! Each call consumes exactly one conversion from the format string,
//! validates the argument's type kind against it, renders or scans, then
//! advances the format pointer and the running count.

use std::io::{BufRead, Write};

use velac_gen::Slot;
use velac_sem::{BuiltinFn, TypeKind};
use velac_util::{Ptr, RuntimeError, RuntimeResult, TypeId};

use crate::objects;
use crate::vm::{Stream, Vm};

/// Length modifier of a conversion (`hh`, `h`, `l`, `ll`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeMod {
    Normal,
    ShortShort,
    Short,
    Long,
    LongLong,
}

/// One parsed format segment: the literal prefix plus at most one
/// conversion specifier.
pub struct FormatSeg {
    /// Bytes of the format consumed by this segment.
    pub len: usize,
    /// The conversion letter, if the segment has a conversion.
    pub letter: Option<u8>,
    /// Expected argument kind; `Void` for a conversion-free segment.
    pub expected: TypeKind,
    pub size_mod: SizeMod,
    /// Flags/width/precision text between '%' and the letter.
    pub spec: String,
}

/// Scans the next segment of a format string. Returns `None` on an
/// invalid conversion.
pub fn parse_format(format: &[u8]) -> Option<FormatSeg> {
    let mut i = 0;
    while i < format.len() {
        if format[i] != b'%' {
            i += 1;
            continue;
        }
        if format.get(i + 1) == Some(&b'%') {
            i += 2;
            continue;
        }
        // A real conversion: flags, width, precision, size, letter.
        let spec_start = i + 1;
        let mut j = spec_start;
        while j < format.len() && matches!(format[j], b'-' | b'+' | b' ' | b'0' | b'#') {
            j += 1;
        }
        while j < format.len() && format[j].is_ascii_digit() {
            j += 1;
        }
        if format.get(j) == Some(&b'.') {
            j += 1;
            while j < format.len() && format[j].is_ascii_digit() {
                j += 1;
            }
        }
        let spec_end = j;
        let mut size_mod = SizeMod::Normal;
        if format.get(j) == Some(&b'h') {
            size_mod = SizeMod::Short;
            j += 1;
            if format.get(j) == Some(&b'h') {
                size_mod = SizeMod::ShortShort;
                j += 1;
            }
        } else if format.get(j) == Some(&b'l') {
            size_mod = SizeMod::Long;
            j += 1;
            if format.get(j) == Some(&b'l') {
                size_mod = SizeMod::LongLong;
                j += 1;
            }
        }
        let letter = *format.get(j)?;
        let expected = match letter {
            b'd' | b'i' => TypeKind::Int,
            b'u' => TypeKind::UInt,
            b'x' | b'X' => TypeKind::UInt,
            b'f' | b'F' | b'e' | b'E' | b'g' | b'G' => TypeKind::Real,
            b's' => TypeKind::Str,
            b'c' => TypeKind::Char,
            b'v' => TypeKind::Interface,
            _ => return None,
        };
        return Some(FormatSeg {
            len: j + 1,
            letter: Some(letter),
            expected,
            size_mod,
            spec: String::from_utf8_lossy(&format[spec_start..spec_end]).into_owned(),
        });
    }
    Some(FormatSeg {
        len: format.len(),
        letter: None,
        expected: TypeKind::Void,
        size_mod: SizeMod::Normal,
        spec: String::new(),
    })
}

/// printf-side kind compatibility.
pub fn compatible_printf(expected: TypeKind, actual: TypeKind) -> bool {
    match expected {
        TypeKind::Void => actual == TypeKind::Void,
        TypeKind::Int | TypeKind::UInt => actual.is_ordinal(),
        TypeKind::Real => actual.is_real(),
        TypeKind::Str => actual == TypeKind::Str,
        TypeKind::Char => actual == TypeKind::Char || actual.is_integer(),
        TypeKind::Interface => true,
        _ => false,
    }
}

/// scanf-side kind compatibility; `actual` is the pointee kind.
pub fn compatible_scanf(expected: TypeKind, actual: TypeKind) -> bool {
    match expected {
        TypeKind::Void => actual == TypeKind::Void,
        TypeKind::Int | TypeKind::UInt => actual.is_integer(),
        TypeKind::Real => actual.is_real(),
        TypeKind::Str => actual == TypeKind::Str,
        TypeKind::Char => actual == TypeKind::Char,
        _ => false,
    }
}

fn pad(text: String, spec: &str) -> String {
    let left_align = spec.contains('-');
    let zero_pad = spec.starts_with('0') || spec.contains("-0");
    let width: usize = spec
        .trim_start_matches(['-', '+', ' ', '0', '#'])
        .split('.')
        .next()
        .unwrap_or("")
        .parse()
        .unwrap_or(0);
    if text.len() >= width {
        return text;
    }
    let fill = width - text.len();
    if left_align {
        format!("{text}{}", " ".repeat(fill))
    } else if zero_pad && !text.starts_with('-') {
        format!("{}{text}", "0".repeat(fill))
    } else if zero_pad {
        format!("-{}{}", "0".repeat(fill), &text[1..])
    } else {
        format!("{}{text}", " ".repeat(fill))
    }
}

fn precision(spec: &str) -> Option<usize> {
    spec.split_once('.').and_then(|(_, p)| p.parse().ok())
}

/// Renders one conversion.
pub fn render(vm: &Vm, seg: &FormatSeg, value: Slot, type_id: TypeId) -> RuntimeResult<String> {
    let letter = match seg.letter {
        Some(l) => l,
        None => return Ok(String::new()),
    };
    let text = match letter {
        b'd' | b'i' => pad(value.int_val().to_string(), &seg.spec),
        b'u' => pad(value.uint_val().to_string(), &seg.spec),
        b'x' => pad(format!("{:x}", value.uint_val()), &seg.spec),
        b'X' => pad(format!("{:X}", value.uint_val()), &seg.spec),
        b'c' => (value.int_val() as u8 as char).to_string(),
        b'f' | b'F' => {
            let prec = precision(&seg.spec).unwrap_or(6);
            pad(format!("{:.*}", prec, value.real_val()), &seg.spec)
        }
        b'e' | b'E' => {
            let prec = precision(&seg.spec).unwrap_or(6);
            let mut text = format!("{:.*e}", prec, value.real_val());
            if letter == b'E' {
                text = text.to_uppercase();
            }
            pad(text, &seg.spec)
        }
        b'g' | b'G' => {
            let mut text = format_shortest(value.real_val());
            if letter == b'G' {
                text = text.to_uppercase();
            }
            pad(text, &seg.spec)
        }
        b's' => {
            let bytes = objects::read_str(vm, value.ptr_val())?;
            pad(String::from_utf8_lossy(&bytes).into_owned(), &seg.spec)
        }
        b'v' => {
            let pretty = seg.size_mod == SizeMod::LongLong;
            repr_value(vm, value, type_id, 0, pretty)?
        }
        _ => return Err(vm.error("Invalid format string")),
    };
    Ok(text)
}

fn format_shortest(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{value}")
    } else {
        let text = format!("{value}");
        text
    }
}

const REPR_DEPTH_CAP: usize = 5;

/// `%v`: pretty-print a value of any type.
pub fn repr_value(vm: &Vm, value: Slot, type_id: TypeId, depth: usize, pretty: bool) -> RuntimeResult<String> {
    if depth > REPR_DEPTH_CAP {
        return Ok("...".to_string());
    }
    let types = &vm.program.types;
    let kind = types.kind(type_id);
    Ok(match kind {
        TypeKind::Void => "void".to_string(),
        TypeKind::Int8 | TypeKind::Int16 | TypeKind::Int32 | TypeKind::Int => value.int_val().to_string(),
        TypeKind::UInt8 | TypeKind::UInt16 | TypeKind::UInt32 | TypeKind::UInt => value.uint_val().to_string(),
        TypeKind::Bool => {
            if value.bool_val() {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        TypeKind::Char => (value.int_val() as u8 as char).to_string(),
        TypeKind::Real32 | TypeKind::Real => format_shortest(value.real_val()),
        TypeKind::Ptr | TypeKind::WeakPtr => {
            if value.ptr_val().is_null() {
                "null".to_string()
            } else {
                format!("{}", value.ptr_val())
            }
        }
        TypeKind::Str => {
            let bytes = objects::read_str(vm, value.ptr_val())?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if depth > 0 {
                format!("\"{text}\"")
            } else {
                text
            }
        }
        TypeKind::Array => {
            let base = types.base(type_id);
            let base_kind = types.kind(base);
            let item_size = types.size(base).map_err(|e| vm.error(e))?;
            let len = types.get(type_id).num_items;
            let mut items = Vec::new();
            for i in 0..len {
                let item = vm.load(value.ptr_val().add(i * item_size), base_kind)?;
                items.push(repr_value(vm, item, base, depth + 1, pretty)?);
            }
            format!("[{}]", items.join(" "))
        }
        TypeKind::DynArray => {
            let array = value.ptr_val();
            if array.is_null() || objects::dyn_array_data(vm, array)?.is_null() {
                "[]".to_string()
            } else {
                let base = types.base(type_id);
                let base_kind = types.kind(base);
                let item_size = types.size(base).map_err(|e| vm.error(e))?;
                let len = objects::dyn_array_len(vm, array)?;
                let data = objects::dyn_array_data(vm, array)?;
                let mut items = Vec::new();
                for i in 0..len {
                    let item = vm.load(data.add(i * item_size), base_kind)?;
                    items.push(repr_value(vm, item, base, depth + 1, pretty)?);
                }
                format!("[{}]", items.join(" "))
            }
        }
        TypeKind::Map => {
            let map = value.ptr_val();
            let mut keys = Vec::new();
            if !map.is_null() && !vm.read_ptr(map.add(8))?.is_null() {
                objects::map_keys(vm, map, type_id, &mut keys)?;
            }
            let key_type = types.map_key(type_id);
            let mut entries = Vec::new();
            for key in keys {
                entries.push(repr_value(vm, key, key_type, depth + 1, pretty)?);
            }
            format!("map[{}]", entries.join(" "))
        }
        TypeKind::Struct | TypeKind::Closure => {
            let fields: Vec<(i64, TypeId)> = types
                .get(type_id)
                .fields
                .iter()
                .map(|f| (f.offset, f.type_id))
                .collect();
            let mut parts = Vec::new();
            for (offset, field_type) in fields {
                let field_kind = types.kind(field_type);
                let field = vm.load(value.ptr_val().add(offset), field_kind)?;
                parts.push(repr_value(vm, field, field_type, depth + 1, pretty)?);
            }
            let sep = if pretty { ",\n " } else { " " };
            format!("{{{}}}", parts.join(sep))
        }
        TypeKind::Interface => {
            let iface = value.ptr_val();
            let self_ptr = Ptr(vm.read_u64(iface)?);
            let self_type = objects::slot_to_type(Slot(vm.read_u64(iface.add(8))?));
            match (self_ptr.is_null(), self_type) {
                (false, Some(concrete)) => {
                    let base = types.base(concrete);
                    let base_kind = types.kind(base);
                    let inner = vm.load(self_ptr, base_kind)?;
                    repr_value(vm, inner, base, depth + 1, pretty)?
                }
                _ => "null".to_string(),
            }
        }
        TypeKind::Fiber => "fiber".to_string(),
        TypeKind::Fn => "fn".to_string(),
        _ => return Err(vm.error("Illegal type")),
    })
}

// --- Scanning

/// A byte source for the scanf family: an in-memory string or a buffered
/// reader, with single-byte lookahead.
pub enum ScanSource {
    Memory { bytes: Vec<u8>, pos: usize },
    Stream(StreamRef),
}

/// Marker for reading through the VM's stream table (borrow juggling: the
/// caller passes the stream id and the VM).
pub struct StreamRef {
    pub id: usize,
    pub peeked: Option<u8>,
}

impl ScanSource {
    pub fn peek(&mut self, vm: &mut Vm) -> Option<u8> {
        match self {
            ScanSource::Memory { bytes, pos } => bytes.get(*pos).copied(),
            ScanSource::Stream(stream) => {
                if stream.peeked.is_none() {
                    stream.peeked = read_stream_byte(vm, stream.id);
                }
                stream.peeked
            }
        }
    }

    pub fn next(&mut self, vm: &mut Vm) -> Option<u8> {
        match self {
            ScanSource::Memory { bytes, pos } => {
                let b = bytes.get(*pos).copied();
                if b.is_some() {
                    *pos += 1;
                }
                b
            }
            ScanSource::Stream(stream) => {
                if let Some(b) = stream.peeked.take() {
                    return Some(b);
                }
                read_stream_byte(vm, stream.id)
            }
        }
    }

    /// Bytes consumed so far (memory sources only).
    pub fn consumed(&self) -> usize {
        match self {
            ScanSource::Memory { pos, .. } => *pos,
            ScanSource::Stream(_) => 0,
        }
    }

    fn skip_whitespace(&mut self, vm: &mut Vm) {
        while matches!(self.peek(vm), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.next(vm);
        }
    }
}

fn read_stream_byte(vm: &mut Vm, id: usize) -> Option<u8> {
    match vm.streams.get_mut(id) {
        Some(Stream::Reader(reader)) => {
            let buf = reader.fill_buf().ok()?;
            if buf.is_empty() {
                return None;
            }
            let b = buf[0];
            reader.consume(1);
            Some(b)
        }
        _ => None,
    }
}

/// Scans one conversion into `dest`. Returns 1 on a successful match.
pub fn scan(
    vm: &mut Vm,
    source: &mut ScanSource,
    seg: &FormatSeg,
    format: &[u8],
    dest: Ptr,
    dest_kind: TypeKind,
    str_type: TypeId,
) -> RuntimeResult<i64> {
    // Literal prefix: whitespace in the format skips input whitespace,
    // anything else must match exactly.
    let mut i = 0;
    while i < seg.len {
        let f = format[i];
        if f == b'%' {
            if format.get(i + 1) == Some(&b'%') {
                if source.peek(vm) == Some(b'%') {
                    source.next(vm);
                }
                i += 2;
                continue;
            }
            break;
        }
        if f.is_ascii_whitespace() {
            source.skip_whitespace(vm);
        } else if source.peek(vm) == Some(f) {
            source.next(vm);
        } else {
            return Ok(0);
        }
        i += 1;
    }
    let Some(letter) = seg.letter else {
        return Ok(0);
    };

    if letter != b'c' {
        source.skip_whitespace(vm);
    }
    match letter {
        b'd' | b'i' | b'u' | b'x' | b'X' => {
            let mut text = Vec::new();
            if matches!(source.peek(vm), Some(b'-' | b'+')) {
                text.push(source.next(vm).expect("peeked"));
            }
            let radix = if matches!(letter, b'x' | b'X') { 16 } else { 10 };
            while source.peek(vm).is_some_and(|b| (b as char).is_digit(radix)) {
                text.push(source.next(vm).expect("peeked"));
            }
            let text = String::from_utf8_lossy(&text).into_owned();
            let value = if radix == 16 {
                u64::from_str_radix(text.trim_start_matches(['-', '+']), 16).ok()
            } else {
                text.parse::<i64>().ok().map(|v| v as u64)
            };
            match value {
                Some(v) => {
                    vm.store(dest, dest_kind, Slot::from_uint(v), 0)?;
                    Ok(1)
                }
                None => Ok(0),
            }
        }
        b'f' | b'e' | b'g' => {
            let mut text = Vec::new();
            while source
                .peek(vm)
                .is_some_and(|b| b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E'))
            {
                text.push(source.next(vm).expect("peeked"));
            }
            match String::from_utf8_lossy(&text).parse::<f64>() {
                Ok(v) => {
                    vm.store(dest, dest_kind, Slot::from_real(v), 0)?;
                    Ok(1)
                }
                Err(_) => Ok(0),
            }
        }
        b'c' => match source.next(vm) {
            Some(b) => {
                vm.store(dest, TypeKind::Char, Slot::from_int(b as i64), 0)?;
                Ok(1)
            }
            None => Ok(0),
        },
        b's' => {
            let mut text = Vec::new();
            while source.peek(vm).is_some_and(|b| !b.is_ascii_whitespace()) {
                text.push(source.next(vm).expect("peeked"));
            }
            // Replace the old string the destination holds.
            let old = Ptr(vm.read_u64(dest)?);
            vm.change_ref_cnt_typed(Slot::from_ptr(old), str_type, -1)?;
            let new = objects::make_str(vm, &text)?;
            vm.write_u64(dest, new.0)?;
            Ok(if text.is_empty() { 0 } else { 1 })
        }
        _ => Err(vm.error("Invalid format string")),
    }
}

/// Shared driver for the six printf/scanf built-ins.
pub fn io_builtin(vm: &mut Vm, builtin: BuiltinFn, arg_type: Option<TypeId>) -> RuntimeResult<()> {
    let console = matches!(builtin, BuiltinFn::Printf | BuiltinFn::Scanf);
    let string = matches!(builtin, BuiltinFn::Sprintf | BuiltinFn::Sscanf);
    let scanning = matches!(builtin, BuiltinFn::Scanf | BuiltinFn::Fscanf | BuiltinFn::Sscanf);

    let fiber = vm.fiber();
    let top = fiber.top;
    let value = fiber.slot(top - 1);
    let format_ptr = fiber.slot(top - 2).ptr_val();
    let stream_slot = fiber.slot(top - 3);
    let count = fiber.slot(top - 4).int_val();

    // The format pointer advances past each consumed conversion, so the
    // remaining text is read up to the NUL terminator.
    let format_bytes = objects::read_cstr(vm, format_ptr)?;
    let seg = parse_format(&format_bytes).ok_or_else(|| vm.error("Invalid format string"))?;

    let actual_kind = arg_type.map_or(TypeKind::Void, |t| vm.program.types.kind(t));
    let compat = if scanning {
        compatible_scanf(seg.expected, actual_kind)
    } else {
        compatible_printf(seg.expected, actual_kind)
    };
    if !compat {
        let what = if scanning { "scanf" } else { "printf" };
        let actual = arg_type.map_or_else(
            || "void".to_string(),
            |t| vm.program.types.kind(t).spelling().to_string(),
        );
        return Err(vm.error(format!(
            "Incompatible types {} and {} in {}",
            seg.expected.spelling(),
            actual,
            what
        )));
    }

    if !scanning {
        // Rendering first: no side effects happen before validation.
        let rendered = match seg.letter {
            Some(_) => render(vm, &seg, value, arg_type.expect("conversion has an argument"))?,
            None => String::new(),
        };
        let mut out = literal_text(&format_bytes[..seg.len], seg.letter.is_some());
        out.push_str(&rendered);

        if string {
            let dest = stream_slot.ptr_val();
            let prev_len = count;
            let new_len = prev_len + out.len() as i64;
            let in_place = !dest.is_null() && objects::str_capacity(vm, dest)? >= new_len + 1;
            let dest = if in_place {
                vm.write_i64(dest.add(-16), new_len)?;
                dest
            } else {
                let new = objects::alloc_str(vm, new_len)?;
                if !dest.is_null() {
                    let old = objects::read_str(vm, dest)?;
                    vm.write_bytes(new, &old[..prev_len as usize])?;
                    let str_type = vm.program.str_type;
                    vm.change_ref_cnt_typed(Slot::from_ptr(dest), str_type, -1)?;
                }
                new
            };
            vm.write_bytes(dest.add(prev_len), out.as_bytes())?;
            vm.write_bytes(dest.add(new_len), &[0])?;
            let fiber = vm.fiber_mut();
            let top = fiber.top;
            fiber.set_slot(top - 3, Slot::from_ptr(dest));
        } else {
            let stream_id = if console {
                0
            } else {
                let file = stream_slot.ptr_val();
                if file.is_null() || !vm.file_system_enabled {
                    return Err(vm.error("printf destination is null"));
                }
                vm.read_u64(file)? as usize
            };
            match vm.streams.get_mut(stream_id) {
                Some(Stream::Writer(w)) => {
                    w.write_all(out.as_bytes())
                        .map_err(|e| RuntimeError::new(format!("printf destination is null ({e})")))?;
                    let _ = w.flush();
                }
                _ => return Err(vm.error("printf destination is null")),
            }
        }

        let fiber = vm.fiber_mut();
        let top = fiber.top;
        fiber.set_slot(top - 2, Slot::from_ptr(format_ptr.add(seg.len as i64)));
        fiber.set_slot(top - 4, Slot::from_int(count + out.len() as i64));
        fiber.remove(1);
        return Ok(());
    }

    // Scanning
    let mut source = if string {
        // The source pointer advances between calls, so read from the NUL
        // terminator rather than the dimension block.
        let src = stream_slot.ptr_val();
        ScanSource::Memory {
            bytes: objects::read_cstr(vm, src)?,
            pos: 0,
        }
    } else if console {
        ScanSource::Stream(StreamRef { id: 2, peeked: None })
    } else {
        let file = stream_slot.ptr_val();
        if file.is_null() || !vm.file_system_enabled {
            return Err(vm.error("scanf source is null"));
        }
        let id = vm.read_u64(file)? as usize;
        ScanSource::Stream(StreamRef { id, peeked: None })
    };

    let cnt = if seg.letter.is_none() {
        0
    } else {
        let dest = value.ptr_val();
        if dest.is_null() {
            return Err(vm.error("scanf destination is null"));
        }
        let str_type = vm.program.str_type;
        scan(vm, &mut source, &seg, &format_bytes, dest, actual_kind, str_type)?
    };

    let consumed = source.consumed();
    let fiber = vm.fiber_mut();
    let top = fiber.top;
    fiber.set_slot(top - 2, Slot::from_ptr(format_ptr.add(seg.len as i64)));
    fiber.set_slot(top - 4, Slot::from_int(count + cnt));
    if string {
        let src = stream_slot.ptr_val();
        fiber.set_slot(top - 3, Slot::from_ptr(src.add(consumed as i64)));
    }
    fiber.remove(1);
    Ok(())
}

/// The literal text of a segment with `%%` collapsed and the trailing
/// conversion stripped.
fn literal_text(segment: &[u8], has_conversion: bool) -> String {
    let mut out = String::new();
    let mut i = 0;
    let end = segment.len();
    while i < end {
        if segment[i] == b'%' {
            if segment.get(i + 1) == Some(&b'%') {
                out.push('%');
                i += 2;
                continue;
            }
            if has_conversion {
                break;
            }
        }
        out.push(segment[i] as char);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_text() {
        let seg = parse_format(b"hello\n").unwrap();
        assert_eq!(seg.len, 6);
        assert!(seg.letter.is_none());
        assert_eq!(seg.expected, TypeKind::Void);
    }

    #[test]
    fn test_parse_conversion() {
        let seg = parse_format(b"x = %d\n").unwrap();
        assert_eq!(seg.len, 6);
        assert_eq!(seg.letter, Some(b'd'));
        assert_eq!(seg.expected, TypeKind::Int);
    }

    #[test]
    fn test_parse_escaped_percent() {
        let seg = parse_format(b"100%% done").unwrap();
        assert!(seg.letter.is_none());
        assert_eq!(seg.len, 10);
    }

    #[test]
    fn test_parse_width_precision() {
        let seg = parse_format(b"%08.3f").unwrap();
        assert_eq!(seg.letter, Some(b'f'));
        assert_eq!(seg.spec, "08.3");
        assert_eq!(seg.expected, TypeKind::Real);
    }

    #[test]
    fn test_parse_size_modifiers() {
        let seg = parse_format(b"%lld").unwrap();
        assert_eq!(seg.size_mod, SizeMod::LongLong);
        let seg = parse_format(b"%llv").unwrap();
        assert_eq!(seg.expected, TypeKind::Interface);
    }

    #[test]
    fn test_invalid_conversion_rejected() {
        assert!(parse_format(b"%q").is_none());
    }

    #[test]
    fn test_compatibility() {
        assert!(compatible_printf(TypeKind::Int, TypeKind::Int32));
        assert!(compatible_printf(TypeKind::Int, TypeKind::Bool));
        assert!(!compatible_printf(TypeKind::Int, TypeKind::Real));
        assert!(!compatible_printf(TypeKind::Str, TypeKind::Int));
        assert!(compatible_printf(TypeKind::Interface, TypeKind::Map));
        assert!(compatible_scanf(TypeKind::Real, TypeKind::Real32));
        assert!(!compatible_scanf(TypeKind::Char, TypeKind::Int));
    }

    #[test]
    fn test_literal_text() {
        assert_eq!(literal_text(b"a%%b", false), "a%b");
        assert_eq!(literal_text(b"x = %d", true), "x = ");
    }

    #[test]
    fn test_pad() {
        assert_eq!(pad("42".into(), "5"), "   42");
        assert_eq!(pad("42".into(), "-5"), "42   ");
        assert_eq!(pad("42".into(), "05"), "00042");
        assert_eq!(pad("-42".into(), "05"), "-0042");
        assert_eq!(pad("42".into(), ""), "42");
    }
}

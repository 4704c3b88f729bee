use std::io::Write;

use super::ListEntry;

/// Escape a name for the listing wire format: `\` and `"` get a
/// backslash prefix, everything else passes through untouched.
pub fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Serialize one entry. Bit-exact inverse of the parser for every entry
/// the parser accepts: `parse(write(e)) == e`.
pub fn write_entry<W: Write>(w: &mut W, entry: &ListEntry) -> std::io::Result<()> {
    let type_char = if entry.is_dir { 'd' } else { 'f' };
    let size = if entry.is_dir { 0 } else { entry.size };
    write!(
        w,
        "{type_char}\"{}\" {} {}",
        escape_name(&entry.name),
        size,
        entry.last_modified
    )?;
    if !entry.extras.is_empty() {
        w.write_all(b"#")?;
        for (i, (key, value)) in entry.extras.iter().enumerate() {
            if i > 0 {
                w.write_all(b"&")?;
            }
            if value.is_empty() {
                write!(w, "{key}")?;
            } else {
                write!(w, "{key}={value}")?;
            }
        }
    }
    w.write_all(b"\n")
}

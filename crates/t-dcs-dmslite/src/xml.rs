//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Minimal XML tag building and searching."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
//! Tag-level XML helpers. The dmslite peers exchange flat elements with
//! text content only; fields are located by bounded textual search.

use std::fmt::Write;

/// Append `<name>value</name>` to the buffer.
pub fn add_tag(buf: &mut String, name: &str, value: &str) {
    let _ = write!(buf, "<{}>{}</{}>", name, value, name);
}

/// Find the text content of the first `<name>...</name>` element.
pub fn read_tag<'a>(doc: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = doc.find(&open)? + open.len();
    let rest = &doc[start..];
    let end = rest.find(&close)?;
    Some(&rest[..end])
}

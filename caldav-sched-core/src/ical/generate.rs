//! ICS text generation.

use crate::ical::{Calendar, Component, Property};

/// Maximum content line length in octets, excluding the CRLF.
const MAX_LINE_OCTETS: usize = 75;

/// Serialize a calendar as ICS text with CRLF line endings and folded long lines.
pub fn generate_ics(calendar: &Calendar) -> String {
    let mut out = String::new();
    push_line(&mut out, "BEGIN:VCALENDAR");
    for prop in &calendar.properties {
        push_line(&mut out, &content_line(prop));
    }
    for component in &calendar.components {
        write_component(&mut out, component);
    }
    push_line(&mut out, "END:VCALENDAR");
    out
}

fn write_component(out: &mut String, component: &Component) {
    push_line(out, &format!("BEGIN:{}", component.name));
    for prop in &component.properties {
        push_line(out, &content_line(prop));
    }
    for child in &component.components {
        write_component(out, child);
    }
    push_line(out, &format!("END:{}", component.name));
}

fn content_line(prop: &Property) -> String {
    let mut line = prop.name.clone();
    for (key, value) in &prop.params {
        line.push(';');
        line.push_str(key);
        line.push('=');
        if value.contains([':', ';', ',']) {
            line.push('"');
            line.push_str(value);
            line.push('"');
        } else {
            line.push_str(value);
        }
    }
    line.push(':');
    line.push_str(&prop.value);
    line
}

/// Append `line`, folding at 75 octets without splitting a UTF-8 character.
fn push_line(out: &mut String, line: &str) {
    let mut width = 0;
    for ch in line.chars() {
        let len = ch.len_utf8();
        if width + len > MAX_LINE_OCTETS {
            out.push_str("\r\n ");
            width = 1;
        }
        out.push(ch);
        width += len;
    }
    out.push_str("\r\n");
}

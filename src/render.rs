use std::collections::HashMap;

/// Substitute `{column}` placeholders with the row's values.
///
/// A placeholder whose column is absent from the row is left untouched, so a
/// typo in the template surfaces verbatim in the delivered message instead of
/// failing the batch. Single left-to-right pass over the template: inserted
/// values are never re-scanned, so a value containing brace syntax comes out
/// literally no matter which column it belongs to.
pub fn render_template(template: &str, row: &HashMap<String, String>) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find('}') else {
            rendered.push_str(tail);
            return rendered;
        };
        match row.get(&tail[1..end]) {
            Some(value) => {
                rendered.push_str(value);
                rest = &tail[end + 1..];
            }
            None => {
                // Not a known column; keep the brace literal and rescan from
                // the next character.
                rendered.push('{');
                rest = &tail[1..];
            }
        }
    }

    rendered.push_str(rest);
    rendered
}

const PARAGRAPH_MARKER: &str = "|||PARAGRAPH|||";

/// Convert the authored plain text into the HTML alternative part,
/// preserving formatting exactly as typed.
///
/// Pure function of the rendered body text; the same input yields the same
/// markup regardless of sender or recipient.
pub fn html_body(text: &str) -> String {
    let content = escape_html(text).replace("\r\n", "\n").replace('\r', "\n");

    // A blank line becomes paragraph spacing, a single break a line break.
    let content = content
        .replace("\n\n", PARAGRAPH_MARKER)
        .replace('\n', "<br>")
        .replace(PARAGRAPH_MARKER, "<br><br>");

    // Keep manually typed alignment: pairs of spaces and tabs survive as
    // non-breaking spaces.
    let content = content
        .replace("  ", "&nbsp;&nbsp;")
        .replace('\t', "&nbsp;&nbsp;&nbsp;&nbsp;");

    format!(
        "<div style=\"font-family: 'Segoe UI', Tahoma, Geneva, Verdana, sans-serif; \
         font-size: 14px; line-height: 1.2; color: #333333; margin: 0; padding: 0;\">\
         {content}</div>"
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            other => escaped.push(other),
        }
    }
    escaped
}

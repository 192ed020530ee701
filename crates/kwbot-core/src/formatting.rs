//! Formatting utilities (Telegram HTML, entity decoding).

use crate::domain::Match;

/// Longest title we put into a notification.
const MAX_TITLE_CHARS: usize = 300;

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Decode the named entities listing pages actually use plus numeric `&#NN;` / `&#xHH;`.
/// Unknown entities are left as-is.
pub fn decode_html_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail[1..].find(';').map(|i| i + 1).filter(|i| *i <= 10) else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };

        let entity = &tail[1..semi];
        match decode_entity(entity) {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    if let Some(num) = entity.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse::<u32>().ok()?,
        };
        return char::from_u32(code);
    }
    Some(match entity {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        _ => return None,
    })
}

pub fn truncate_text(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out = s.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

/// Notification body for one matched post.
pub fn format_match_html(m: &Match) -> String {
    let keywords = m
        .keywords
        .iter()
        .map(|k| escape_html(k))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "🔔 <b>Keyword match</b>\n\n\
Keywords: {keywords}\n\
Title: {}\n\
Link: <a href=\"{url}\">{url}</a>",
        escape_html(&truncate_text(&m.post.title, MAX_TITLE_CHARS)),
        url = escape_html(&m.post.url),
    )
}

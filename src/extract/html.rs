use std::sync::LazyLock;

use regex::Regex;

static ANCHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<a\s([^>]*)>(.*?)</a\s*>").unwrap());
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z][a-z0-9_:-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</p\s*>|</div\s*>").unwrap());
static LIST_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<li[^>]*>").unwrap());
static BLANK_LINES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n\s*\n+").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub href: String,
    pub class: Option<String>,
    pub text: String,
}

impl Anchor {
    pub fn has_class(&self, class: &str) -> bool {
        self.class
            .as_deref()
            .map(|classes| classes.split_whitespace().any(|value| value == class))
            .unwrap_or(false)
    }
}

/// All `<a href=...>` elements of a document, in document order.
pub fn anchors(html: &str) -> Vec<Anchor> {
    ANCHOR_RE
        .captures_iter(html)
        .filter_map(|caps| {
            let attrs = caps.get(1)?.as_str();
            let href = attribute(attrs, "href")?;
            Some(Anchor {
                href,
                class: attribute(attrs, "class"),
                text: text_content(caps.get(2).map(|m| m.as_str()).unwrap_or_default()),
            })
        })
        .collect()
}

pub fn attribute(attrs: &str, name: &str) -> Option<String> {
    ATTR_RE.captures_iter(attrs).find_map(|caps| {
        let key = caps.get(1)?.as_str();
        if !key.eq_ignore_ascii_case(name) {
            return None;
        }
        let value = caps.get(2).or_else(|| caps.get(3)).or_else(|| caps.get(4))?;
        Some(decode_entities(value.as_str()))
    })
}

/// Inline text of a fragment: tags dropped, entities decoded, whitespace collapsed.
pub fn text_content(fragment: &str) -> String {
    let stripped = TAG_RE.replace_all(fragment, " ");
    decode_entities(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Block text of a fragment, keeping one line per paragraph and list item.
pub fn block_text(fragment: &str) -> String {
    let marked = LIST_ITEM_RE.replace_all(fragment, "\n- ");
    let broken = BREAK_RE.replace_all(&marked, "\n");
    let stripped = TAG_RE.replace_all(&broken, "");
    let decoded = decode_entities(&stripped);
    let lines = decoded
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    BLANK_LINES_RE
        .replace_all(lines.trim(), "\n\n")
        .into_owned()
}

pub fn decode_entities(value: &str) -> String {
    value
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_anchors_with_attributes() {
        let html = r#"<p><a class="filename-link big" href='a.tar?x=1&amp;y=2'>A <b>file</b></a>
            <a name=top>no href</a><A HREF=b.tar>b</A></p>"#;
        let found = anchors(html);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].href, "a.tar?x=1&y=2");
        assert!(found[0].has_class("filename-link"));
        assert_eq!(found[0].text, "A file");
        assert_eq!(found[1].href, "b.tar");
        assert_eq!(found[1].class, None);
    }

    #[test]
    fn block_text_keeps_list_items() {
        let text = block_text("<p>Build Highlights:</p><ul><li>one</li><li>two &amp; three</li></ul>");
        assert_eq!(text, "Build Highlights:\n\n- one\n- two & three");
    }
}

//! Opt-in rewriting of outgoing HTML bodies to look less like bulk spam.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

const SPAM_TRIGGERS: &[&str] = &[
    "FREE!",
    "URGENT!",
    "ACT NOW!",
    "LIMITED TIME!",
    "CLICK HERE NOW",
    "MAKE MONEY FAST",
    "GUARANTEED",
    "NO OBLIGATION",
    "RISK FREE",
    "CASH BONUS",
];

const UNSUBSCRIBE_PLACEHOLDER: &str = "{unsubscribe_link}";

lazy_static! {
    static ref SPAM_TRIGGER_RES: Vec<Regex> = SPAM_TRIGGERS
        .iter()
        .map(|t| Regex::new(&format!("(?i){}", regex::escape(t))).unwrap())
        .collect();
    static ref REPEATED_BANG_RE: Regex = Regex::new(r"!{2,}").unwrap();
    static ref REPEATED_QUESTION_RE: Regex = Regex::new(r"\?{2,}").unwrap();
    static ref SHOUTING_RE: Regex = Regex::new(r"[A-Z]{4,}").unwrap();
    /// Spans the de-shouting pass must not touch.
    static ref PROTECTED_RE: Regex = Regex::new(r#"<[^>]*>|https?://[^\s"'<>]+"#).unwrap();
    static ref IMG_TAG_RE: Regex = Regex::new(r"(?i)<img\b([^>]*?)(\s*/?)>").unwrap();
    static ref ALT_ATTR_RE: Regex = Regex::new(r"(?i)\salt\s*=").unwrap();
    static ref VAGUE_LINK_RE: Regex =
        Regex::new(r"(?i)<a(\s[^>]*)?>\s*(?:click here|here|link)\s*</a>").unwrap();
}

const DEFAULT_IMAGE_ALT: &str = "Newsletter Image";
const VAGUE_LINK_TEXT: &str = "Read More";

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(word: &str) -> String {
    let lower = word.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn soften_spam_triggers(html: &str) -> String {
    SPAM_TRIGGER_RES
        .iter()
        .fold(html.to_string(), |acc, re| {
            re.replace_all(&acc, |c: &Captures| title_case(&c[0]))
                .into_owned()
        })
}

fn collapse_punctuation(html: &str) -> String {
    let html = REPEATED_BANG_RE.replace_all(html, "!");
    REPEATED_QUESTION_RE.replace_all(&html, "?").into_owned()
}

fn deshout_text(text: &str) -> String {
    SHOUTING_RE
        .replace_all(text, |c: &Captures| capitalize(&c[0]))
        .into_owned()
}

fn deshout(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut last = 0;
    for m in PROTECTED_RE.find_iter(html) {
        out.push_str(&deshout_text(&html[last..m.start()]));
        out.push_str(m.as_str());
        last = m.end();
    }
    out.push_str(&deshout_text(&html[last..]));
    out
}

/// Gives images without alt text a default one and replaces anchor text
/// that says nothing about the target.
fn balance_text_and_markup(html: &str) -> String {
    let html = IMG_TAG_RE.replace_all(html, |c: &Captures| {
        if ALT_ATTR_RE.is_match(&c[1]) {
            c[0].to_string()
        } else {
            format!("<img{} alt=\"{}\"{}>", &c[1], DEFAULT_IMAGE_ALT, &c[2])
        }
    });
    VAGUE_LINK_RE
        .replace_all(&html, |c: &Captures| {
            format!(
                "<a{}>{}</a>",
                c.get(1).map_or("", |m| m.as_str()),
                VAGUE_LINK_TEXT
            )
        })
        .into_owned()
}

#[derive(Debug, Clone)]
pub struct ContentOptimizer {
    site_url: String,
}

impl ContentOptimizer {
    pub fn new(site_url: &str) -> Self {
        Self {
            site_url: site_url.to_string(),
        }
    }

    /// Runs before `{unsubscribe_link}` substitution so the footer it may
    /// add still gets the recipient's link.
    pub fn optimize(&self, html: &str) -> String {
        let mut body = soften_spam_triggers(html);
        body = collapse_punctuation(&body);
        body = deshout(&body);
        body = balance_text_and_markup(&body);

        if !body.contains(UNSUBSCRIBE_PLACEHOLDER) {
            body.push_str(&format!(
                "<br><br><small><a href=\"{}\">Unsubscribe from this newsletter</a></small>",
                UNSUBSCRIBE_PLACEHOLDER
            ));
        }

        format!(
            "<p style=\"font-size:12px;color:#666;text-align:center;\">Having trouble viewing this email? <a href=\"{}\">View it in your browser</a></p>{}",
            self.site_url, body
        )
    }
}

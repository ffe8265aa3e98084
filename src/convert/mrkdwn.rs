//! Slack "mrkdwn" text rendering. Approximates Slack's own renderer with a
//! hand-rolled scanner rather than a general Markdown library, matching the
//! style the rest of this crate's parsers already use (`common.rs`'s
//! char-scanning `MessageUtils`) rather than pulling in a CommonMark crate
//! for a format that isn't CommonMark.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::emoji::EmojiValue;

/// Resolves the bits of context mrkdwn rendering needs but doesn't own:
/// mention labels/mxids, channel labels, and emoji lookups.
pub trait MentionContext {
    fn user_label(&self, slack_user_id: &str) -> Option<String>;
    fn user_mxid(&self, slack_user_id: &str) -> Option<String>;
    fn channel_label(&self, slack_channel_id: &str) -> Option<String>;
    fn emoji(&self, shortcode: &str) -> Option<EmojiValue>;
}

pub struct Rendered {
    pub plain: String,
    pub html: String,
    pub user_mentions: Vec<String>,
    pub mentions_room: bool,
}

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"<@(?P<mention_user>[UW][A-Z0-9]+)(\|(?P<mention_label>[^>]*))?>",
        r"|<#(?P<mention_chan>C[A-Z0-9]+)(\|(?P<chan_label>[^>]*))?>",
        r"|<!(?P<special>channel|everyone|here)>",
        r"|<!date\^(?P<date_epoch>\d+)\^(?P<date_fmt>[^|>]+)(\|(?P<date_url>[^>]+))?>",
        r"|<(?P<url>https?://[^|>]+)(\|(?P<url_label>[^>]+))?>",
    ))
    .unwrap()
});

static BOLD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*\n]+)\*").unwrap());
static ITALIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_([^_\n]+)_").unwrap());
static STRIKE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"~([^~\n]+)~").unwrap());
static CODE_BLOCK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```(.+?)```").unwrap());
static INLINE_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`\n]+)`").unwrap());
static SHORTCODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":([a-zA-Z0-9_+\-]+):").unwrap());
static ESCAPE_FIXUP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\\)(__|\*\*)([^\s])").unwrap());

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Doubles a pre-existing backslash before a literal `__`/`**` run so a
/// downstream renderer doesn't consume it as an escape for bold/italic
/// markers Slack never intended as such.
fn fixup_escapes(text: &str) -> String {
    ESCAPE_FIXUP_RE
        .replace_all(text, |caps: &regex::Captures| {
            format!("\\\\{}{}", &caps[2], &caps[3])
        })
        .into_owned()
}

/// Renders one line/paragraph of Slack mrkdwn into plain text and HTML.
pub fn render(text: &str, ctx: &dyn MentionContext) -> Rendered {
    let text = fixup_escapes(text);

    let mut user_mentions = Vec::new();
    let mut mentions_room = false;
    let mut plain_segments: Vec<String> = Vec::new();
    let mut html_segments: Vec<String> = Vec::new();

    let mut last = 0;
    for caps in TOKEN_RE.captures_iter(&text) {
        let m = caps.get(0).unwrap();
        let before = &text[last..m.start()];
        plain_segments.push(before.to_string());
        html_segments.push(html_escape(before));
        last = m.end();

        if let Some(user_id) = caps.name("mention_user") {
            let user_id = user_id.as_str();
            user_mentions.push(user_id.to_string());
            let label = caps
                .name("mention_label")
                .map(|m| m.as_str().to_string())
                .or_else(|| ctx.user_label(user_id))
                .unwrap_or_else(|| user_id.to_string());
            plain_segments.push(format!("@{}", label));
            match ctx.user_mxid(user_id) {
                Some(mxid) => html_segments.push(format!(
                    r#"<a href="https://matrix.to/#/{}">@{}</a>"#,
                    mxid,
                    html_escape(&label)
                )),
                None => html_segments.push(format!("@{}", html_escape(&label))),
            }
        } else if let Some(chan_id) = caps.name("mention_chan") {
            let chan_id = chan_id.as_str();
            let label = caps
                .name("chan_label")
                .map(|m| m.as_str().to_string())
                .or_else(|| ctx.channel_label(chan_id))
                .unwrap_or_else(|| chan_id.to_string());
            plain_segments.push(format!("#{}", label));
            html_segments.push(format!("#{}", html_escape(&label)));
        } else if let Some(special) = caps.name("special") {
            mentions_room = true;
            let tag = format!("@{}", special.as_str());
            plain_segments.push(tag.clone());
            html_segments.push(tag);
        } else if let Some(epoch) = caps.name("date_epoch") {
            let rendered = render_date(epoch.as_str(), caps.name("date_fmt").unwrap().as_str());
            match caps.name("date_url") {
                Some(url) => {
                    plain_segments.push(rendered.clone());
                    html_segments.push(format!(
                        r#"<a href="{}">{}</a>"#,
                        html_escape(url.as_str()),
                        html_escape(&rendered)
                    ));
                }
                None => {
                    plain_segments.push(rendered.clone());
                    html_segments.push(html_escape(&rendered));
                }
            }
        } else if let Some(url) = caps.name("url") {
            let url = url.as_str();
            let label = caps.name("url_label").map(|m| m.as_str()).unwrap_or(url);
            plain_segments.push(label.to_string());
            html_segments.push(format!(
                r#"<a href="{}">{}</a>"#,
                html_escape(url),
                html_escape(label)
            ));
        }
    }
    plain_segments.push(text[last..].to_string());
    html_segments.push(html_escape(&text[last..]));

    let plain = plain_segments.concat();
    let mut html = html_segments.concat();

    html = CODE_BLOCK_RE
        .replace_all(&html, |caps: &regex::Captures| {
            format!("<pre><code>{}</code></pre>", &caps[1])
        })
        .into_owned();
    html = INLINE_CODE_RE
        .replace_all(&html, "<code>$1</code>")
        .into_owned();
    html = BOLD_RE.replace_all(&html, "<strong>$1</strong>").into_owned();
    html = ITALIC_RE.replace_all(&html, "<em>$1</em>").into_owned();
    html = STRIKE_RE.replace_all(&html, "<del>$1</del>").into_owned();
    html = render_shortcodes_html(&html, ctx);

    let plain = render_shortcodes_plain(&plain, ctx);

    Rendered {
        plain,
        html,
        user_mentions,
        mentions_room,
    }
}

fn render_shortcodes_plain(text: &str, ctx: &dyn MentionContext) -> String {
    SHORTCODE_RE
        .replace_all(text, |caps: &regex::Captures| {
            let name = &caps[1];
            match ctx.emoji(name) {
                Some(EmojiValue::Unicode(u)) => u,
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn render_shortcodes_html(text: &str, ctx: &dyn MentionContext) -> String {
    SHORTCODE_RE
        .replace_all(text, |caps: &regex::Captures| {
            let name = &caps[1];
            match ctx.emoji(name) {
                Some(EmojiValue::Unicode(u)) => u,
                Some(EmojiValue::Image(uri)) => crate::emoji::format_custom_emoji_html(name, &uri),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// `<!date^EPOCH^FORMAT^URL>`: only the literal substitution tokens named
/// in the spec are handled; anything else in FORMAT passes through as-is.
fn render_date(epoch: &str, format: &str) -> String {
    let Ok(secs) = epoch.parse::<i64>() else {
        return format.to_string();
    };
    let Some(dt) = chrono::DateTime::from_timestamp(secs, 0) else {
        return format.to_string();
    };
    let date_num = dt.format("%Y-%m-%d").to_string();
    let date = dt.format("%B %-d").to_string();
    let date_pretty = dt.format("%B %-d, %Y").to_string();
    let date_short = dt.format("%b %-d").to_string();
    let date_short_pretty = dt.format("%b %-d, %Y").to_string();
    let date_long = dt.format("%A, %B %-d, %Y").to_string();
    let date_long_pretty = date_long.clone();
    let time = dt.format("%H:%M").to_string();
    let time_secs = dt.format("%H:%M:%S").to_string();

    format
        .replace("{date_num}", &date_num)
        .replace("{date_pretty}", &date_pretty)
        .replace("{date_short_pretty}", &date_short_pretty)
        .replace("{date_short}", &date_short)
        .replace("{date_long_pretty}", &date_long_pretty)
        .replace("{date_long}", &date_long)
        .replace("{date}", &date)
        .replace("{time_secs}", &time_secs)
        .replace("{time}", &time)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopCtx;
    impl MentionContext for NoopCtx {
        fn user_label(&self, slack_user_id: &str) -> Option<String> {
            Some(format!("user-{}", slack_user_id))
        }
        fn user_mxid(&self, slack_user_id: &str) -> Option<String> {
            Some(format!("@_slack_{}:example.org", slack_user_id))
        }
        fn channel_label(&self, slack_channel_id: &str) -> Option<String> {
            Some(format!("chan-{}", slack_channel_id))
        }
        fn emoji(&self, shortcode: &str) -> Option<EmojiValue> {
            if shortcode == "smile" {
                Some(EmojiValue::Unicode("\u{1F604}".to_string()))
            } else {
                None
            }
        }
    }

    #[test]
    fn bold_italic_strike_code_render_to_html_tags() {
        let r = render("*bold* _italic_ ~strike~ `code`", &NoopCtx);
        assert!(r.html.contains("<strong>bold</strong>"));
        assert!(r.html.contains("<em>italic</em>"));
        assert!(r.html.contains("<del>strike</del>"));
        assert!(r.html.contains("<code>code</code>"));
    }

    #[test]
    fn user_mention_resolves_label_and_mxid() {
        let r = render("hello <@U123>", &NoopCtx);
        assert_eq!(r.user_mentions, vec!["U123".to_string()]);
        assert!(r.plain.contains("@user-U123"));
        assert!(r.html.contains("@_slack_U123:example.org"));
    }

    #[test]
    fn channel_special_mention_sets_room_flag() {
        let r = render("<!channel> heads up", &NoopCtx);
        assert!(r.mentions_room);
        assert!(r.plain.contains("@channel"));
    }

    #[test]
    fn url_with_label_becomes_anchor() {
        let r = render("<https://example.com|Example>", &NoopCtx);
        assert!(r.html.contains(r#"<a href="https://example.com">Example</a>"#));
        assert_eq!(r.plain, "Example");
    }

    #[test]
    fn shortcode_resolves_to_unicode() {
        let r = render("nice :smile:", &NoopCtx);
        assert!(r.plain.contains('\u{1F604}'));
        assert!(r.html.contains('\u{1F604}'));
    }

    #[test]
    fn unknown_shortcode_passes_through() {
        let r = render(":not_an_emoji:", &NoopCtx);
        assert_eq!(r.plain, ":not_an_emoji:");
    }

    #[test]
    fn html_special_chars_are_escaped_outside_tokens() {
        let r = render("<script>alert(1)</script>", &NoopCtx);
        assert!(!r.html.contains("<script>"));
        assert!(r.html.contains("&lt;script&gt;"));
    }
}

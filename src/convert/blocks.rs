//! Block Kit / rich_text rendering: `header`, `divider`, `section`,
//! `rich_text`, `context`. Unknown block types collapse into a single
//! notice even when several appear consecutively.

use serde_json::Value;

use super::mrkdwn::{self, MentionContext};

pub struct BlockRender {
    pub plain: String,
    pub html: String,
}

const ORDERED_STYLES: [&str; 3] = ["1", "a", "i"];

pub fn render(blocks: &[Value], ctx: &dyn MentionContext) -> BlockRender {
    let mut plain_parts = Vec::new();
    let mut html_parts = Vec::new();
    let mut last_was_unsupported = false;

    for block in blocks {
        let block_type = block.get("type").and_then(Value::as_str).unwrap_or("");
        match block_type {
            "header" => {
                last_was_unsupported = false;
                let text = plain_text(block.pointer("/text/text"));
                plain_parts.push(text.clone());
                html_parts.push(format!("<h4>{}</h4>", mrkdwn::render(&text, ctx).html));
            }
            "divider" => {
                last_was_unsupported = false;
                plain_parts.push("---".to_string());
                html_parts.push("<hr/>".to_string());
            }
            "section" => {
                last_was_unsupported = false;
                render_section(block, ctx, &mut plain_parts, &mut html_parts);
            }
            "rich_text" => {
                last_was_unsupported = false;
                render_rich_text(block, ctx, &mut plain_parts, &mut html_parts);
            }
            "context" => {
                last_was_unsupported = false;
                let pieces: Vec<String> = block
                    .get("elements")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .map(|el| {
                        el.get("text")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_default()
                    })
                    .collect();
                let text = pieces.join(" ");
                plain_parts.push(text.clone());
                html_parts.push(format!("<sup>{}</sup>", mrkdwn::render(&text, ctx).html));
            }
            _ => {
                if !last_was_unsupported {
                    plain_parts.push("Slack message contains unsupported elements.".to_string());
                    html_parts.push("<i>Slack message contains unsupported elements.</i>".to_string());
                    last_was_unsupported = true;
                }
            }
        }
    }

    BlockRender {
        plain: plain_parts.join("\n"),
        html: html_parts.join("\n"),
    }
}

fn plain_text(value: Option<&Value>) -> String {
    value.and_then(Value::as_str).unwrap_or_default().to_string()
}

fn render_section(block: &Value, ctx: &dyn MentionContext, plain: &mut Vec<String>, html: &mut Vec<String>) {
    if let Some(fields) = block.get("fields").and_then(Value::as_array) {
        let mut rows_plain = Vec::new();
        let mut rows_html = String::from("<table>");
        for field in fields {
            let text = plain_text(field.get("text"));
            let rendered = mrkdwn::render(&text, ctx);
            rows_plain.push(rendered.plain.clone());
            rows_html.push_str(&format!("<tr><td>{}</td></tr>", rendered.html));
        }
        rows_html.push_str("</table>");
        plain.push(rows_plain.join("\n"));
        html.push(rows_html);
        return;
    }

    let text = plain_text(block.pointer("/text/text"));
    let rendered = mrkdwn::render(&text, ctx);
    plain.push(rendered.plain);
    html.push(rendered.html);
}

fn render_rich_text(block: &Value, ctx: &dyn MentionContext, plain: &mut Vec<String>, html: &mut Vec<String>) {
    let Some(elements) = block.get("elements").and_then(Value::as_array) else {
        return;
    };
    for element in elements {
        render_rich_text_element(element, ctx, 0, plain, html);
    }
}

fn render_rich_text_element(
    element: &Value,
    ctx: &dyn MentionContext,
    depth: usize,
    plain: &mut Vec<String>,
    html: &mut Vec<String>,
) {
    match element.get("type").and_then(Value::as_str).unwrap_or("") {
        "rich_text_section" => {
            let (p, h) = render_inline_elements(element, ctx);
            plain.push(p);
            html.push(h);
        }
        "rich_text_preformatted" => {
            let (p, _) = render_inline_elements(element, ctx);
            plain.push(p.clone());
            html.push(format!("<pre><code>{}</code></pre>", escape_html(&p)));
        }
        "rich_text_quote" => {
            let (p, h) = render_inline_elements(element, ctx);
            let border_depth = element.get("border").and_then(Value::as_u64).unwrap_or(1).max(1);
            plain.push(format!("{}{}", "> ".repeat(border_depth as usize), p));
            html.push(nest_blockquotes(&h, border_depth as usize));
        }
        "rich_text_list" => {
            let ordered = element.get("style").and_then(Value::as_str) == Some("ordered");
            let offset = element.get("offset").and_then(Value::as_u64).unwrap_or(0);
            let items = element.get("elements").and_then(Value::as_array).cloned().unwrap_or_default();
            let tag = if ordered { "ol" } else { "ul" };
            let style = ORDERED_STYLES[depth % ORDERED_STYLES.len()];
            html.push(format!(r#"<{} style="list-style-type: {}">"#, tag, list_style_css(style, ordered)));
            for (i, item) in items.iter().enumerate() {
                let (p, h) = render_inline_elements(item, ctx);
                let marker = if ordered {
                    format!("{}. ", offset as usize + i + 1)
                } else {
                    "- ".to_string()
                };
                plain.push(format!("{}{}", marker, p));
                html.push(format!("<li>{}</li>", h));
            }
            html.push(format!("</{}>", tag));
        }
        _ => {}
    }
}

fn list_style_css(style: &str, ordered: bool) -> &'static str {
    if !ordered {
        return "disc";
    }
    match style {
        "a" => "lower-alpha",
        "i" => "lower-roman",
        _ => "decimal",
    }
}

fn nest_blockquotes(inner: &str, depth: usize) -> String {
    let mut html = inner.to_string();
    for _ in 0..depth {
        html = format!("<blockquote>{}</blockquote>", html);
    }
    html
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn render_inline_elements(container: &Value, ctx: &dyn MentionContext) -> (String, String) {
    let Some(elements) = container.get("elements").and_then(Value::as_array) else {
        return (String::new(), String::new());
    };

    let mut plain = String::new();
    let mut html = String::new();

    for el in elements {
        let el_type = el.get("type").and_then(Value::as_str).unwrap_or("");
        match el_type {
            "text" => {
                let text = el.get("text").and_then(Value::as_str).unwrap_or("");
                let style = el.get("style");
                let bold = style.and_then(|s| s.get("bold")).and_then(Value::as_bool).unwrap_or(false);
                let italic = style.and_then(|s| s.get("italic")).and_then(Value::as_bool).unwrap_or(false);
                let strike = style.and_then(|s| s.get("strike")).and_then(Value::as_bool).unwrap_or(false);
                let code = style.and_then(|s| s.get("code")).and_then(Value::as_bool).unwrap_or(false);

                plain.push_str(text);
                let mut rendered = escape_html(text);
                if code {
                    rendered = format!("<code>{}</code>", rendered);
                }
                if strike {
                    rendered = format!("<del>{}</del>", rendered);
                }
                if italic {
                    rendered = format!("<em>{}</em>", rendered);
                }
                if bold {
                    rendered = format!("<strong>{}</strong>", rendered);
                }
                html.push_str(&rendered);
            }
            "user" => {
                let user_id = el.get("user_id").and_then(Value::as_str).unwrap_or("");
                let label = ctx.user_label(user_id).unwrap_or_else(|| user_id.to_string());
                plain.push_str(&format!("@{}", label));
                match ctx.user_mxid(user_id) {
                    Some(mxid) => html.push_str(&format!(
                        r#"<a href="https://matrix.to/#/{}">@{}</a>"#,
                        mxid,
                        escape_html(&label)
                    )),
                    None => html.push_str(&format!("@{}", escape_html(&label))),
                }
            }
            "channel" => {
                let channel_id = el.get("channel_id").and_then(Value::as_str).unwrap_or("");
                let label = ctx.channel_label(channel_id).unwrap_or_else(|| channel_id.to_string());
                plain.push_str(&format!("#{}", label));
                html.push_str(&format!("#{}", escape_html(&label)));
            }
            "link" => {
                let url = el.get("url").and_then(Value::as_str).unwrap_or("");
                let text = el.get("text").and_then(Value::as_str).unwrap_or(url);
                plain.push_str(text);
                html.push_str(&format!(r#"<a href="{}">{}</a>"#, escape_html(url), escape_html(text)));
            }
            "broadcast" => {
                let range = el.get("range").and_then(Value::as_str).unwrap_or("channel");
                plain.push_str(&format!("@{}", range));
                html.push_str(&format!("@{}", range));
            }
            "emoji" => {
                let name = el.get("name").and_then(Value::as_str).unwrap_or("");
                if let Some(unicode) = el
                    .get("unicode")
                    .and_then(Value::as_str)
                    .map(render_emoji_codepoints)
                {
                    plain.push_str(&unicode);
                    html.push_str(&unicode);
                } else {
                    match ctx.emoji(name) {
                        Some(crate::emoji::EmojiValue::Unicode(u)) => {
                            plain.push_str(&u);
                            html.push_str(&u);
                        }
                        Some(crate::emoji::EmojiValue::Image(uri)) => {
                            plain.push_str(&format!(":{}:", name));
                            html.push_str(&crate::emoji::format_custom_emoji_html(name, &uri));
                        }
                        _ => {
                            plain.push_str(&format!(":{}:", name));
                            html.push_str(&format!(":{}:", name));
                        }
                    }
                }
            }
            "color" => {
                let value = el.get("value").and_then(Value::as_str).unwrap_or("");
                plain.push_str(value);
                html.push_str(&format!(
                    r#"<span data-mx-color="{0}" style="color:{0}">{0}</span>"#,
                    escape_html(value)
                ));
            }
            "date" => {
                let epoch = el.get("timestamp").map(|v| v.to_string()).unwrap_or_default();
                let format = el.get("format").and_then(Value::as_str).unwrap_or("{date_short}");
                let rendered = mrkdwn::render(&format!("<!date^{}^{}>", epoch, format), ctx);
                plain.push_str(&rendered.plain);
                html.push_str(&rendered.html);
            }
            _ => {}
        }
    }

    (plain, html)
}

/// `unicode` on a rich_text emoji element is dash-separated hex code
/// points, e.g. `"1f44d"` or `"1f468-200d-1f469-200d-1f467"`.
fn render_emoji_codepoints(raw: &str) -> String {
    raw.split('-')
        .filter_map(|hex| u32::from_str_radix(hex, 16).ok())
        .filter_map(char::from_u32)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::emoji::EmojiValue;

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
        fn emoji(&self, _shortcode: &str) -> Option<EmojiValue> {
            None
        }
    }

    #[test]
    fn header_and_divider_render() {
        let blocks = json!([
            { "type": "header", "text": { "type": "plain_text", "text": "Title" } },
            { "type": "divider" }
        ]);
        let result = render(blocks.as_array().unwrap(), &NoopCtx);
        assert!(result.html.contains("<h4>Title</h4>"));
        assert!(result.html.contains("<hr/>"));
    }

    #[test]
    fn unsupported_blocks_collapse_to_one_notice() {
        let blocks = json!([{ "type": "image" }, { "type": "video" }]);
        let result = render(blocks.as_array().unwrap(), &NoopCtx);
        assert_eq!(
            result.html.matches("unsupported elements").count(),
            1
        );
    }

    #[test]
    fn rich_text_section_bold_and_user_mention() {
        let blocks = json!([{
            "type": "rich_text",
            "elements": [{
                "type": "rich_text_section",
                "elements": [
                    { "type": "text", "text": "hi ", "style": { "bold": true } },
                    { "type": "user", "user_id": "U1" }
                ]
            }]
        }]);
        let result = render(blocks.as_array().unwrap(), &NoopCtx);
        assert!(result.html.contains("<strong>hi </strong>"));
        assert!(result.plain.contains("@user-U1"));
    }

    #[test]
    fn ordered_list_cycles_style_by_depth() {
        assert_eq!(list_style_css(ORDERED_STYLES[0], true), "decimal");
        assert_eq!(list_style_css(ORDERED_STYLES[1], true), "lower-alpha");
        assert_eq!(list_style_css(ORDERED_STYLES[2], true), "lower-roman");
    }

    #[test]
    fn emoji_unicode_codepoints_join_into_one_glyph() {
        assert_eq!(render_emoji_codepoints("1f44d"), "\u{1F44D}");
    }
}

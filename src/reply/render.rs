use super::{Article, ReplyBody};
use crate::message::xml::{cdata, XmlElement};
use crate::message::ParseError;
use std::fmt::Write as _;

fn push_field(out: &mut String, name: &str, value: &str) {
    let _ = write!(out, "<{name}>{}</{name}>", cdata(value));
}

fn push_optional(out: &mut String, name: &str, value: Option<&str>) {
    if let Some(value) = value {
        push_field(out, name, value);
    }
}

/// Renders a passive reply document addressed to `to` from `from`.
pub fn render_xml(body: &ReplyBody, to: &str, from: &str, create_time: i64) -> String {
    let mut out = String::from("<xml>");
    push_field(&mut out, "ToUserName", to);
    push_field(&mut out, "FromUserName", from);
    let _ = write!(out, "<CreateTime>{create_time}</CreateTime>");
    push_field(&mut out, "MsgType", body.msg_type());

    match body {
        ReplyBody::Text { content } => push_field(&mut out, "Content", content),
        ReplyBody::Image { media_id } => {
            out.push_str("<Image>");
            push_field(&mut out, "MediaId", media_id);
            out.push_str("</Image>");
        }
        ReplyBody::Voice { media_id } => {
            out.push_str("<Voice>");
            push_field(&mut out, "MediaId", media_id);
            out.push_str("</Voice>");
        }
        ReplyBody::Video {
            media_id,
            title,
            description,
        } => {
            out.push_str("<Video>");
            push_field(&mut out, "MediaId", media_id);
            push_optional(&mut out, "Title", title.as_deref());
            push_optional(&mut out, "Description", description.as_deref());
            out.push_str("</Video>");
        }
        ReplyBody::Music {
            thumb_media_id,
            title,
            description,
            music_url,
            hq_music_url,
        } => {
            out.push_str("<Music>");
            push_optional(&mut out, "Title", title.as_deref());
            push_optional(&mut out, "Description", description.as_deref());
            push_optional(&mut out, "MusicUrl", music_url.as_deref());
            push_optional(&mut out, "HQMusicUrl", hq_music_url.as_deref());
            push_field(&mut out, "ThumbMediaId", thumb_media_id);
            out.push_str("</Music>");
        }
        ReplyBody::News { articles } => {
            let _ = write!(out, "<ArticleCount>{}</ArticleCount><Articles>", articles.len());
            for article in articles {
                out.push_str("<item>");
                push_field(&mut out, "Title", &article.title);
                push_field(&mut out, "Description", &article.description);
                push_field(&mut out, "PicUrl", &article.pic_url);
                push_field(&mut out, "Url", &article.url);
                out.push_str("</item>");
            }
            out.push_str("</Articles>");
        }
    }

    out.push_str("</xml>");
    out
}

fn nested_text(root: &XmlElement, outer: &str, inner: &str) -> Option<String> {
    root.child(outer)
        .and_then(|el| el.child_text(inner))
        .map(ToOwned::to_owned)
}

/// Reads a passive reply document back into a [`ReplyBody`].
///
/// Used when a forwarded reply has to be pushed out-of-band. Returns
/// `Ok(None)` for an empty document or an unsupported reply type.
pub fn parse_reply_xml(raw: &[u8]) -> Result<Option<ReplyBody>, ParseError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let root = XmlElement::parse(raw)?;
    let Some(msg_type) = root.child_text("MsgType") else {
        return Ok(None);
    };
    let media = |outer: &str| {
        nested_text(&root, outer, "MediaId").ok_or(ParseError::MissingField("MediaId"))
    };

    let body = match msg_type.trim().to_ascii_lowercase().as_str() {
        "text" => ReplyBody::Text {
            content: root.child_text("Content").unwrap_or_default().to_string(),
        },
        "image" => ReplyBody::Image {
            media_id: media("Image")?,
        },
        "voice" => ReplyBody::Voice {
            media_id: media("Voice")?,
        },
        "video" => ReplyBody::Video {
            media_id: media("Video")?,
            title: nested_text(&root, "Video", "Title"),
            description: nested_text(&root, "Video", "Description"),
        },
        "music" => ReplyBody::Music {
            thumb_media_id: nested_text(&root, "Music", "ThumbMediaId")
                .ok_or(ParseError::MissingField("ThumbMediaId"))?,
            title: nested_text(&root, "Music", "Title"),
            description: nested_text(&root, "Music", "Description"),
            music_url: nested_text(&root, "Music", "MusicUrl"),
            hq_music_url: nested_text(&root, "Music", "HQMusicUrl"),
        },
        "news" => ReplyBody::News {
            articles: root
                .child("Articles")
                .map(|articles| {
                    articles
                        .children
                        .iter()
                        .map(|item| Article {
                            title: item.child_text("Title").unwrap_or_default().to_string(),
                            description: item
                                .child_text("Description")
                                .unwrap_or_default()
                                .to_string(),
                            pic_url: item.child_text("PicUrl").unwrap_or_default().to_string(),
                            url: item.child_text("Url").unwrap_or_default().to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
        },
        _ => return Ok(None),
    };

    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(title: &str) -> Article {
        Article {
            title: title.to_string(),
            description: "d".to_string(),
            pic_url: "http://example.com/p.png".to_string(),
            url: "http://example.com".to_string(),
        }
    }

    #[test]
    fn text_reply_is_addressed_to_sender() {
        let xml = render_xml(&ReplyBody::text("hi"), "openid", "gh_account", 42);
        let root = XmlElement::parse(xml.as_bytes()).unwrap();
        assert_eq!(root.child_text("ToUserName"), Some("openid"));
        assert_eq!(root.child_text("FromUserName"), Some("gh_account"));
        assert_eq!(root.child_text("CreateTime"), Some("42"));
        assert_eq!(root.child_text("MsgType"), Some("text"));
        assert_eq!(root.child_text("Content"), Some("hi"));
    }

    #[test]
    fn video_reply_omits_absent_optional_fields() {
        let body = ReplyBody::Video {
            media_id: "m".into(),
            title: None,
            description: Some("desc".into()),
        };
        let xml = render_xml(&body, "o", "g", 1);
        assert!(xml.contains("<Video><MediaId><![CDATA[m]]></MediaId>"));
        assert!(!xml.contains("<Title>"));
        assert!(xml.contains("<Description><![CDATA[desc]]></Description>"));
    }

    #[test]
    fn news_reply_lists_articles() {
        let body = ReplyBody::News {
            articles: vec![article("a"), article("b")],
        };
        let xml = render_xml(&body, "o", "g", 1);
        assert!(xml.contains("<ArticleCount>2</ArticleCount>"));
        assert_eq!(xml.matches("<item>").count(), 2);
    }

    #[test]
    fn rendered_replies_parse_back() {
        let bodies = vec![
            ReplyBody::text("a]]>b"),
            ReplyBody::Image { media_id: "i".into() },
            ReplyBody::Voice { media_id: "v".into() },
            ReplyBody::Music {
                thumb_media_id: "t".into(),
                title: Some("song".into()),
                description: None,
                music_url: Some("http://m".into()),
                hq_music_url: None,
            },
            ReplyBody::News {
                articles: vec![article("x")],
            },
        ];
        for body in bodies {
            let xml = render_xml(&body, "o", "g", 1);
            assert_eq!(parse_reply_xml(xml.as_bytes()).unwrap(), Some(body));
        }
    }

    #[test]
    fn empty_or_unknown_forward_documents_yield_none() {
        assert_eq!(parse_reply_xml(b"").unwrap(), None);
        assert_eq!(parse_reply_xml(b"  \n").unwrap(), None);
        assert_eq!(
            parse_reply_xml(b"<xml><MsgType>transfer_customer_service</MsgType></xml>").unwrap(),
            None
        );
        assert!(parse_reply_xml(b"<xml><MsgType>image</MsgType></xml>").is_err());
    }
}

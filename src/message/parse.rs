use super::xml::{XmlElement, XmlError};
use super::{Event, EventKind, InboundMessage, MessageBody, MessageKind};

const SCAN_SCENE_PREFIX: &str = "qrscene_";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Xml(#[from] XmlError),
    #[error("root element must be <xml>, found <{0}>")]
    UnexpectedRoot(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has invalid value `{value}`")]
    InvalidField { field: &'static str, value: String },
}

fn required<'a>(root: &'a XmlElement, field: &'static str) -> Result<&'a str, ParseError> {
    root.child_text(field).ok_or(ParseError::MissingField(field))
}

fn optional(root: &XmlElement, field: &str) -> Option<String> {
    root.child_text(field).map(ToOwned::to_owned)
}

fn text_or_empty(root: &XmlElement, field: &str) -> String {
    root.child_text(field).unwrap_or_default().to_string()
}

fn number<T: std::str::FromStr>(
    root: &XmlElement,
    field: &'static str,
) -> Result<Option<T>, ParseError> {
    root.child_text(field)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| ParseError::InvalidField {
                field,
                value: raw.to_string(),
            })
        })
        .transpose()
}

fn parse_event(root: &XmlElement) -> Result<Event, ParseError> {
    let key = optional(root, "EventKey");
    let mut kind = EventKind::parse(required(root, "Event")?);
    if kind == EventKind::Subscribe
        && key
            .as_deref()
            .is_some_and(|key| key.starts_with(SCAN_SCENE_PREFIX))
    {
        kind = EventKind::SubscribeScan;
    }

    Ok(Event {
        kind,
        key,
        ticket: optional(root, "Ticket"),
        latitude: number(root, "Latitude")?,
        longitude: number(root, "Longitude")?,
        precision: number(root, "Precision")?,
    })
}

/// Parses a plaintext push into an [`InboundMessage`].
pub fn parse_message(plaintext: &str) -> Result<InboundMessage, ParseError> {
    let root = XmlElement::parse(plaintext.as_bytes())?;
    if root.name != "xml" {
        return Err(ParseError::UnexpectedRoot(root.name));
    }

    let source = required(&root, "FromUserName")?.to_string();
    let target = required(&root, "ToUserName")?.to_string();
    let kind = MessageKind::parse(required(&root, "MsgType")?);
    let create_time = number::<i64>(&root, "CreateTime")?.unwrap_or_default();

    let body = match &kind {
        MessageKind::Text => MessageBody::Text {
            content: text_or_empty(&root, "Content"),
        },
        MessageKind::Image => MessageBody::Image {
            media_id: text_or_empty(&root, "MediaId"),
            pic_url: optional(&root, "PicUrl"),
        },
        MessageKind::Voice => MessageBody::Voice {
            media_id: text_or_empty(&root, "MediaId"),
            format: optional(&root, "Format"),
            recognition: optional(&root, "Recognition"),
        },
        MessageKind::Video => MessageBody::Video {
            media_id: text_or_empty(&root, "MediaId"),
            thumb_media_id: optional(&root, "ThumbMediaId"),
        },
        MessageKind::ShortVideo => MessageBody::ShortVideo {
            media_id: text_or_empty(&root, "MediaId"),
            thumb_media_id: optional(&root, "ThumbMediaId"),
        },
        MessageKind::Location => MessageBody::Location {
            latitude: number(&root, "Location_X")?.unwrap_or_default(),
            longitude: number(&root, "Location_Y")?.unwrap_or_default(),
            scale: number(&root, "Scale")?,
            label: optional(&root, "Label"),
        },
        MessageKind::Link => MessageBody::Link {
            title: text_or_empty(&root, "Title"),
            description: optional(&root, "Description"),
            url: text_or_empty(&root, "Url"),
        },
        MessageKind::Event => MessageBody::Event(parse_event(&root)?),
        MessageKind::Other(_) => MessageBody::Unknown { kind: kind.clone() },
    };

    Ok(InboundMessage {
        id: optional(&root, "MsgId"),
        source,
        target,
        create_time,
        body,
        raw: plaintext.to_string(),
    })
}

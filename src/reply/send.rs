use super::ReplyBody;
use serde_json::{json, Map, Value};

fn insert_optional(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
}

/// Customer-service message body for `POST /cgi-bin/message/custom/send`.
pub fn direct_message_payload(body: &ReplyBody, touser: &str) -> Value {
    let msgtype = body.msg_type();
    let content = match body {
        ReplyBody::Text { content } => json!({ "content": content }),
        ReplyBody::Image { media_id } | ReplyBody::Voice { media_id } => {
            json!({ "media_id": media_id })
        }
        ReplyBody::Video {
            media_id,
            title,
            description,
        } => {
            let mut video = Map::new();
            video.insert("media_id".into(), Value::String(media_id.clone()));
            insert_optional(&mut video, "title", title.as_deref());
            insert_optional(&mut video, "description", description.as_deref());
            Value::Object(video)
        }
        ReplyBody::Music {
            thumb_media_id,
            title,
            description,
            music_url,
            hq_music_url,
        } => {
            let mut music = Map::new();
            insert_optional(&mut music, "title", title.as_deref());
            insert_optional(&mut music, "description", description.as_deref());
            insert_optional(&mut music, "musicurl", music_url.as_deref());
            insert_optional(&mut music, "hqmusicurl", hq_music_url.as_deref());
            music.insert("thumb_media_id".into(), Value::String(thumb_media_id.clone()));
            Value::Object(music)
        }
        ReplyBody::News { articles } => {
            let articles: Vec<Value> = articles
                .iter()
                .map(|article| {
                    json!({
                        "title": article.title,
                        "description": article.description,
                        "url": article.url,
                        "picurl": article.pic_url,
                    })
                })
                .collect();
            json!({ "articles": articles })
        }
    };

    let mut payload = Map::new();
    payload.insert("touser".into(), Value::String(touser.to_string()));
    payload.insert("msgtype".into(), Value::String(msgtype.to_string()));
    payload.insert(msgtype.to_string(), content);
    Value::Object(payload)
}

//! REST destination store speaking the Notion-style page/database wire
//! format. Pagination and the property codec live here; the pipeline only
//! sees typed records.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use gamedex_core::{LibraryRecord, PropertyId, PropertyValue};
use gamedex_sync::{DestinationError, DestinationStore, RecordPatch};
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.notion.com/v1";
const API_VERSION: &str = "2022-06-28";
const PAGE_SIZE: u32 = 100;

pub struct RestDestination {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestDestination {
    pub fn new(token: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(30))
            .build()
            .context("building destination http client")?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Notion-Version", API_VERSION)
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<Value, DestinationError> {
        let response = builder
            .send()
            .await
            .map_err(|err| DestinationError::Message(format!("{what}: {err}")))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DestinationError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DestinationError::Message(format!(
                "{what}: destination returned {status}: {body}"
            )));
        }
        response
            .json()
            .await
            .map_err(|err| DestinationError::Message(format!("{what}: {err}")))
    }
}

fn plain_text(parts: &Value) -> String {
    parts
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("plain_text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn decode_property(prop: &Value) -> Option<PropertyValue> {
    match prop.get("type")?.as_str()? {
        "title" => Some(PropertyValue::Text(plain_text(prop.get("title")?))),
        "rich_text" => Some(PropertyValue::Text(plain_text(prop.get("rich_text")?))),
        "number" => prop.get("number")?.as_f64().map(PropertyValue::Number),
        "date" => {
            let start = prop.pointer("/date/start")?.as_str()?;
            if let Ok(ts) = DateTime::parse_from_rfc3339(start) {
                Some(PropertyValue::Timestamp(ts.with_timezone(&Utc)))
            } else {
                start
                    .parse::<NaiveDate>()
                    .ok()
                    .map(PropertyValue::Date)
            }
        }
        "multi_select" => Some(PropertyValue::MultiSelect(
            prop.get("multi_select")?
                .as_array()?
                .iter()
                .filter_map(|option| option.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect(),
        )),
        "status" => prop
            .pointer("/status/name")
            .and_then(Value::as_str)
            .map(|name| PropertyValue::Status(name.to_string())),
        "select" => prop
            .pointer("/select/name")
            .and_then(Value::as_str)
            .map(|name| PropertyValue::Status(name.to_string())),
        "url" => prop
            .get("url")
            .and_then(Value::as_str)
            .map(|url| PropertyValue::Url(url.to_string())),
        "checkbox" => prop.get("checkbox")?.as_bool().map(PropertyValue::Checkbox),
        _ => None,
    }
}

/// Titles are only ever read, never written, so Text encodes as rich text.
fn encode_property(value: &PropertyValue) -> Value {
    match value {
        PropertyValue::Text(text) => json!({ "rich_text": [{ "text": { "content": text } }] }),
        PropertyValue::Number(number) => json!({ "number": number }),
        PropertyValue::Date(date) => {
            json!({ "date": { "start": date.format("%Y-%m-%d").to_string() } })
        }
        PropertyValue::Timestamp(ts) => json!({ "date": { "start": ts.to_rfc3339() } }),
        PropertyValue::MultiSelect(values) => json!({
            "multi_select": values.iter().map(|v| json!({ "name": v })).collect::<Vec<_>>()
        }),
        PropertyValue::Status(name) => json!({ "status": { "name": name } }),
        PropertyValue::Url(url) => json!({ "url": url }),
        PropertyValue::Checkbox(checked) => json!({ "checkbox": checked }),
    }
}

fn decode_page(page: &Value) -> Result<LibraryRecord, DestinationError> {
    let id = page
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| DestinationError::Message("page missing id".to_string()))?;
    let library_id = page
        .pointer("/parent/database_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let last_edited = page
        .get("last_edited_time")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let mut properties = BTreeMap::new();
    if let Some(props) = page.get("properties").and_then(Value::as_object) {
        for prop in props.values() {
            let Some(property_id) = prop.get("id").and_then(Value::as_str) else {
                continue;
            };
            if let Some(value) = decode_property(prop) {
                properties.insert(property_id.to_string(), value);
            }
        }
    }

    Ok(LibraryRecord {
        id: id.to_string(),
        library_id: library_id.to_string(),
        last_edited,
        properties,
    })
}

#[async_trait]
impl DestinationStore for RestDestination {
    async fn schema(
        &self,
        library_id: &str,
    ) -> Result<BTreeMap<PropertyId, String>, DestinationError> {
        let value = self
            .send(
                self.request(Method::GET, &format!("databases/{library_id}")),
                "reading library schema",
            )
            .await?;
        let mut schema = BTreeMap::new();
        if let Some(props) = value.get("properties").and_then(Value::as_object) {
            for (name, prop) in props {
                if let Some(id) = prop.get("id").and_then(Value::as_str) {
                    schema.insert(id.to_string(), name.clone());
                }
            }
        }
        Ok(schema)
    }

    async fn list_records(
        &self,
        library_id: &str,
    ) -> Result<Vec<LibraryRecord>, DestinationError> {
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut body = json!({ "page_size": PAGE_SIZE });
            if let Some(cursor) = &cursor {
                body["start_cursor"] = json!(cursor);
            }
            let value = self
                .send(
                    self.request(Method::POST, &format!("databases/{library_id}/query"))
                        .json(&body),
                    "listing library records",
                )
                .await?;

            if let Some(results) = value.get("results").and_then(Value::as_array) {
                for page in results {
                    records.push(decode_page(page)?);
                }
            }

            let has_more = value.get("has_more").and_then(Value::as_bool).unwrap_or(false);
            cursor = value
                .get("next_cursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if !has_more || cursor.is_none() {
                break;
            }
        }
        debug!(count = records.len(), "listed library records");
        Ok(records)
    }

    async fn fetch_record(&self, record_id: &str) -> Result<LibraryRecord, DestinationError> {
        let value = self
            .send(
                self.request(Method::GET, &format!("pages/{record_id}")),
                record_id,
            )
            .await?;
        decode_page(&value)
    }

    async fn update_record(
        &self,
        record_id: &str,
        patch: RecordPatch,
    ) -> Result<(), DestinationError> {
        let mut body = Map::new();
        if !patch.properties.is_empty() {
            let properties: Map<String, Value> = patch
                .properties
                .iter()
                .map(|(pid, value)| (pid.clone(), encode_property(value)))
                .collect();
            body.insert("properties".to_string(), Value::Object(properties));
        }
        if let Some(cover_url) = &patch.cover_url {
            body.insert(
                "cover".to_string(),
                json!({ "type": "external", "external": { "url": cover_url } }),
            );
        }
        if let Some(icon) = &patch.icon {
            let icon_value = if icon.starts_with("http") {
                json!({ "type": "external", "external": { "url": icon } })
            } else {
                json!({ "type": "emoji", "emoji": icon })
            };
            body.insert("icon".to_string(), icon_value);
        }
        if body.is_empty() {
            return Ok(());
        }

        self.send(
            self.request(Method::PATCH, &format!("pages/{record_id}"))
                .json(&Value::Object(body)),
            record_id,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_decode_by_wire_type() {
        let title = json!({ "id": "p1", "type": "title", "title": [
            { "plain_text": "Marvel's " }, { "plain_text": "Spider-Man" }
        ]});
        assert_eq!(
            decode_property(&title),
            Some(PropertyValue::Text("Marvel's Spider-Man".to_string()))
        );

        let number = json!({ "id": "p2", "type": "number", "number": 0.9 });
        assert_eq!(decode_property(&number), Some(PropertyValue::Number(0.9)));

        let date = json!({ "id": "p3", "type": "date", "date": { "start": "2018-09-07" } });
        assert_eq!(
            decode_property(&date),
            Some(PropertyValue::Date(NaiveDate::from_ymd_opt(2018, 9, 7).unwrap()))
        );

        let stamp = json!({ "id": "p4", "type": "date", "date": { "start": "2026-08-26T10:00:00+00:00" } });
        assert!(matches!(
            decode_property(&stamp),
            Some(PropertyValue::Timestamp(_))
        ));

        let tags = json!({ "id": "p5", "type": "multi_select", "multi_select": [
            { "name": "Action" }, { "name": "Adventure" }
        ]});
        assert_eq!(
            decode_property(&tags),
            Some(PropertyValue::MultiSelect(vec![
                "Action".to_string(),
                "Adventure".to_string()
            ]))
        );

        let empty_number = json!({ "id": "p6", "type": "number", "number": null });
        assert_eq!(decode_property(&empty_number), None);
    }

    #[test]
    fn properties_encode_to_wire_shapes() {
        let encoded = encode_property(&PropertyValue::Status("Released".to_string()));
        assert_eq!(encoded.pointer("/status/name").unwrap(), "Released");

        let encoded = encode_property(&PropertyValue::MultiSelect(vec!["Action".to_string()]));
        assert_eq!(encoded.pointer("/multi_select/0/name").unwrap(), "Action");

        let encoded = encode_property(&PropertyValue::Date(
            NaiveDate::from_ymd_opt(2018, 9, 7).unwrap(),
        ));
        assert_eq!(encoded.pointer("/date/start").unwrap(), "2018-09-07");

        let encoded = encode_property(&PropertyValue::Text("notes".to_string()));
        assert_eq!(
            encoded.pointer("/rich_text/0/text/content").unwrap(),
            "notes"
        );
    }

    #[test]
    fn pages_decode_to_records() {
        let page = json!({
            "id": "rec-1",
            "last_edited_time": "2026-08-01T12:00:00+00:00",
            "parent": { "database_id": "lib-0001" },
            "properties": {
                "Name": { "id": "p_title", "type": "title", "title": [{ "plain_text": "Portal" }] },
                "Rating": { "id": "p_rating", "type": "number", "number": 0.9 },
                "Unsupported": { "id": "p_x", "type": "relation", "relation": [] }
            }
        });
        let record = decode_page(&page).unwrap();
        assert_eq!(record.id, "rec-1");
        assert_eq!(record.library_id, "lib-0001");
        assert_eq!(
            record.properties["p_title"],
            PropertyValue::Text("Portal".to_string())
        );
        assert_eq!(record.properties["p_rating"], PropertyValue::Number(0.9));
        // Unsupported wire types are ignored rather than failing the page.
        assert!(!record.properties.contains_key("p_x"));
    }
}

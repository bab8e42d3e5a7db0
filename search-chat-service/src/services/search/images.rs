//! Image list extraction from heterogeneous backend payloads.

use crate::models::ImageList;
use serde_json::Value;

/// Coerce a raw image entry to a URL string. Accepts a bare string or any
/// object carrying a string `url` field.
pub fn coerce_image_url(value: &Value) -> Option<String> {
    match value {
        Value::String(url) => Some(url.trim().to_string()),
        Value::Object(map) => map
            .get("url")
            .and_then(Value::as_str)
            .map(|url| url.trim().to_string()),
        _ => None,
    }
}

/// Keep absolute http(s) URLs, dedupe, cap and preserve discovery order.
pub fn normalize_images(values: &[Value]) -> Vec<String> {
    values
        .iter()
        .filter_map(coerce_image_url)
        .collect::<ImageList>()
        .into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MAX_IMAGES;
    use serde_json::json;

    #[test]
    fn coerces_mixed_shapes() {
        let raw = vec![
            json!("https://img.example.com/a.jpg"),
            json!({"url": "https://img.example.com/b.jpg", "description": "b"}),
            json!({"src": "https://img.example.com/ignored.jpg"}),
            json!(42),
            json!("//img.example.com/protocol-relative.jpg"),
            json!({"url": "https://img.example.com/a.jpg"}),
        ];

        assert_eq!(
            normalize_images(&raw),
            vec![
                "https://img.example.com/a.jpg".to_string(),
                "https://img.example.com/b.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn caps_at_limit() {
        let raw: Vec<Value> = (0..40)
            .map(|i| json!(format!("https://img.example.com/{i}.png")))
            .collect();
        let images = normalize_images(&raw);

        assert_eq!(images.len(), MAX_IMAGES);
        assert_eq!(images[0], "https://img.example.com/0.png");
        assert_eq!(images[14], "https://img.example.com/14.png");
    }
}

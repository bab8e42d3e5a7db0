//! Greeting tool. Pure and deterministic.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GreetingStyle {
    Formal,
    #[default]
    Casual,
    Enthusiastic,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GreetingArgs {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub style: GreetingStyle,
}

pub fn greet(args: &GreetingArgs) -> String {
    let name = args
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());

    match (args.style, name) {
        (GreetingStyle::Formal, Some(name)) => format!("Good day, {}. How may I assist you?", name),
        (GreetingStyle::Formal, None) => "Good day. How may I assist you?".to_string(),
        (GreetingStyle::Casual, Some(name)) => format!("Hey {}! What's up?", name),
        (GreetingStyle::Casual, None) => "Hey there! What's up?".to_string(),
        (GreetingStyle::Enthusiastic, Some(name)) => {
            format!("Hi {}!!! So great to see you! What can we dive into today?", name)
        }
        (GreetingStyle::Enthusiastic, None) => {
            "Hi there!!! So great to see you! What can we dive into today?".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn style_defaults_to_casual() {
        let args: GreetingArgs = serde_json::from_value(json!({"name": "Ada"})).unwrap();
        assert_eq!(greet(&args), "Hey Ada! What's up?");
    }

    #[test]
    fn blank_name_is_ignored() {
        let args: GreetingArgs =
            serde_json::from_value(json!({"name": "  ", "style": "formal"})).unwrap();
        assert_eq!(greet(&args), "Good day. How may I assist you?");
    }

    #[test]
    fn unknown_style_is_rejected() {
        assert!(serde_json::from_value::<GreetingArgs>(json!({"style": "grumpy"})).is_err());
    }
}

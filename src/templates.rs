use minijinja::{context, Environment, UndefinedBehavior};

/// Values available to auto-response templates as `{{ name }}`, `{{ source }}`
/// and `{{ firm }}`.
pub struct AutoResponseContext<'a> {
    pub name: &'a str,
    pub source: &'a str,
    pub firm: &'a str,
}

pub fn render_auto_response(template: &str, ctx: &AutoResponseContext<'_>) -> String {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    if env.add_template("auto_response", template).is_err() {
        return fallback_auto_response(template, ctx);
    }

    let Ok(compiled) = env.get_template("auto_response") else {
        return fallback_auto_response(template, ctx);
    };

    compiled
        .render(context! {
            name => display_name(ctx.name),
            source => ctx.source,
            firm => ctx.firm,
        })
        .map(|text| text.trim().to_string())
        .unwrap_or_else(|_| fallback_auto_response(template, ctx))
}

fn display_name(name: &str) -> &str {
    if name.trim().is_empty() {
        "there"
    } else {
        name.trim()
    }
}

// Templates that fail to parse still go out, with the common placeholders
// substituted literally.
fn fallback_auto_response(template: &str, ctx: &AutoResponseContext<'_>) -> String {
    let mut text = template.to_string();
    for (key, value) in [
        ("name", display_name(ctx.name)),
        ("source", ctx.source),
        ("firm", ctx.firm),
    ] {
        text = text
            .replace(&format!("{{{{ {key} }}}}"), value)
            .replace(&format!("{{{{{key}}}}}"), value);
    }
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> AutoResponseContext<'static> {
        AutoResponseContext {
            name: "Dana",
            source: "landing",
            firm: "Hale & Partners",
        }
    }

    #[test]
    fn renders_placeholders() {
        let text = render_auto_response("Hello {{ name }}, welcome to {{ firm }}.", &ctx());
        assert_eq!(text, "Hello Dana, welcome to Hale & Partners.");
    }

    #[test]
    fn blank_name_reads_as_there() {
        let text = render_auto_response(
            "Hi {{ name }}!",
            &AutoResponseContext {
                name: "  ",
                source: "dashboard",
                firm: "",
            },
        );
        assert_eq!(text, "Hi there!");
    }

    #[test]
    fn unknown_placeholders_render_empty() {
        assert_eq!(render_auto_response("Hi {{ nickname }}.", &ctx()), "Hi .");
    }

    #[test]
    fn broken_template_falls_back_to_literal_substitution() {
        let text = render_auto_response("Hi {{name}}, {% if %}", &ctx());
        assert_eq!(text, "Hi Dana, {% if %}");
    }
}

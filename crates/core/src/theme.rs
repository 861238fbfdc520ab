use colloquy_config::Template;
use serde::Serialize;

/// Classes a presentation layer applies at its root for the chosen look.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StyleScope {
    pub template: Template,
    pub dark_mode: bool,
    pub classes: Vec<String>,
}

impl StyleScope {
    pub fn class_list(&self) -> String {
        self.classes.join(" ")
    }
}

pub fn style_scope(template: Template, dark_mode: bool) -> StyleScope {
    let mut classes = Vec::with_capacity(2);
    if dark_mode {
        classes.push("dark".to_string());
    }
    classes.push(format!("template-{}", template.name()));
    StyleScope {
        template,
        dark_mode,
        classes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dark_vibrant() {
        let scope = style_scope(Template::Vibrant, true);
        assert_eq!(scope.classes, vec!["dark", "template-vibrant"]);
        assert_eq!(scope.class_list(), "dark template-vibrant");
    }

    #[test]
    fn light_mode_has_only_template_class() {
        let scope = style_scope(Template::from_name("unknown"), false);
        assert_eq!(scope.classes, vec!["template-minimal"]);
    }

    #[test]
    fn every_template_is_distinct() {
        let lists: Vec<String> = Template::ALL
            .iter()
            .map(|t| style_scope(*t, false).class_list())
            .collect();
        assert_eq!(lists, vec!["template-minimal", "template-vibrant", "template-elegant"]);
    }
}

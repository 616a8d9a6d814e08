use std::fmt;

/// A property value that can appear in a MOF instance block.
///
/// Migration setting payloads only ever carry integers, strings, and
/// booleans, so anything else is unrepresentable by construction rather
/// than silently skipped at render time.
#[derive(Debug, Clone, PartialEq)]
pub enum MofValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl fmt::Display for MofValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MofValue::Int(n) => write!(f, "{}", n),
            MofValue::Str(s) => write!(f, "\"{}\"", s),
            MofValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Render `instance of <class> { key = value; ... };` over a fixed field
/// list, in declaration order.
pub fn render_instance(class_name: &str, fields: &[(&str, MofValue)]) -> String {
    let mut out = format!("instance of {} {{\n", class_name);
    for (key, value) in fields {
        out.push_str(&format!("{} = {};\n", key, value));
    }
    out.push_str("};");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_every_supported_type() {
        let mof = render_instance(
            "Test_SettingData",
            &[
                ("Count", MofValue::Int(42)),
                ("Name", MofValue::Str("guest-one".to_string())),
                ("Enabled", MofValue::Bool(true)),
                ("Disabled", MofValue::Bool(false)),
            ],
        );

        assert_eq!(
            mof,
            "instance of Test_SettingData {\n\
             Count = 42;\n\
             Name = \"guest-one\";\n\
             Enabled = true;\n\
             Disabled = false;\n\
             };"
        );
    }

    #[test]
    fn preserves_declaration_order() {
        let mof = render_instance(
            "Test_SettingData",
            &[("B", MofValue::Int(2)), ("A", MofValue::Int(1))],
        );

        let b_pos = mof.find("B = 2;").unwrap();
        let a_pos = mof.find("A = 1;").unwrap();
        assert!(b_pos < a_pos);
    }

    #[test]
    fn strings_are_quoted_and_booleans_lowercase() {
        assert_eq!(MofValue::Str("x".to_string()).to_string(), "\"x\"");
        assert_eq!(MofValue::Bool(true).to_string(), "true");
        assert_eq!(MofValue::Int(-3).to_string(), "-3");
    }

    #[test]
    fn empty_field_list_renders_empty_block() {
        assert_eq!(render_instance("Empty", &[]), "instance of Empty {\n};");
    }
}

use crate::{*, error::*, registry::*};

// One `name(args)` item of an annotation, e.g. `array(n)` in "array(n) hex".
#[derive(Clone, Debug)]
pub struct RuleApplication {
    pub name: String,
    pub args: Option<String>, // text between the parentheses, None if there were no parentheses
    pub rule: RuleIdx, // nop if the name is unknown
    pub unknown: bool,
    pub arg_error: Option<Error>, // malformed argument; the application then does nothing
}

impl RuleApplication {
    pub fn new(name: &str, args: Option<&str>, registry: &RuleRegistry) -> Self {
        let (rule, unknown) = match registry.find(name) {
            Some(r) => (r, false),
            None => (registry.nop(), true),
        };
        let mut a = Self {name: name.to_string(), args: args.map(|s| s.to_string()), rule, unknown, arg_error: None};
        if !unknown {
            if let Err(e) = validate_args(registry.get(rule), a.args.as_deref()) {
                a.arg_error = Some(e);
            }
        }
        a
    }

    // Contributes nothing to any stage.
    pub fn is_passthrough(&self) -> bool { self.unknown || self.arg_error.is_some() || self.rule.0 == 0 }

    pub fn args_str(&self) -> &str { self.args.as_deref().unwrap_or("") }

    // Back to annotation syntax.
    pub fn to_text(&self) -> String {
        match &self.args {
            Some(a) => format!("{}({})", self.name, a),
            None => self.name.clone(),
        }
    }
}

// Applications are separated by whitespace and/or commas: "array(n), hex" or "cast(*u64) array(2)".
// Never fails as a whole. Problems are attached to the individual applications.
pub fn parse_annotation(text: &str, registry: &RuleRegistry) -> Vec<RuleApplication> {
    let mut res: Vec<RuleApplication> = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() || c == b',' {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
            i += 1;
        }
        if i == start {
            // Not a name. Swallow until the next separator and report it as an unknown rule.
            let end = text[start..].find(|c: char| c.is_whitespace() || c == ',').map_or(text.len(), |e| start + e);
            res.push(RuleApplication::new(&text[start..end], None, registry));
            i = end;
            continue;
        }
        let name = &text[start..i];
        let mut j = i;
        while j < bytes.len() && bytes[j].is_ascii_whitespace() {
            j += 1;
        }
        if j >= bytes.len() || bytes[j] != b'(' {
            res.push(RuleApplication::new(name, None, registry));
            continue;
        }
        match find_closing_paren(text, j) {
            Ok(close) => {
                res.push(RuleApplication::new(name, Some(&text[j+1..close]), registry));
                i = close + 1;
            }
            Err(e) => {
                // The rest of the text is this application's argument.
                let mut a = RuleApplication::new(name, Some(&text[j+1..]), registry);
                a.arg_error = Some(error!(RuleArgument, "{}: {}", name, e.message));
                res.push(a);
                i = text.len();
            }
        }
    }
    res
}

// `open` is the index of a '('. Returns index of the matching ')'. Brackets of all kinds must balance; quotes are skipped.
fn find_closing_paren(text: &str, open: usize) -> Result<usize> {
    let mut stack: Vec<char> = Vec::new();
    let mut it = text[open..].char_indices();
    while let Some((off, c)) = it.next() {
        match c {
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let expected = match stack.pop() {
                    Some('(') => ')',
                    Some('[') => ']',
                    _ => '}',
                };
                if c != expected {
                    return err!(RuleArgument, "mismatched '{}' at {}", c, open + off);
                }
                if stack.is_empty() {
                    return Ok(open + off);
                }
            }
            '"' | '\'' => {
                let quote = c;
                loop {
                    match it.next() {
                        None => return err!(RuleArgument, "unterminated string at {}", open + off),
                        Some((_, '\\')) => { it.next(); }
                        Some((_, q)) if q == quote => break,
                        Some(_) => (),
                    }
                }
            }
            _ => (),
        }
    }
    err!(RuleArgument, "unterminated '(' at {}", open)
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

// `"a,b"` or `a, b`. Names must be identifiers (or tuple-style field numbers).
pub fn parse_name_list(args: &str) -> Result<Vec<String>> {
    let s = args.trim();
    let inner = if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') { &s[1..s.len()-1] } else { s };
    let mut names: Vec<String> = Vec::new();
    for n in inner.split(',') {
        let n = n.trim();
        if !is_ident(n) && !(!n.is_empty() && n.chars().all(|c| c.is_ascii_digit())) {
            return err!(RuleArgument, "bad member name: '{}'", n);
        }
        names.push(n.to_string());
    }
    Ok(names)
}

fn validate_args(spec: &RuleSpec, args: Option<&str>) -> Result<()> {
    let args = args.map(|a| a.trim());
    let missing = || err!(RuleArgument, "{} expects {}", spec.name, spec.signature());
    match (spec.schema, args) {
        (ArgSchema::None, None) => Ok(()),
        (ArgSchema::None, Some(a)) if a.is_empty() => Ok(()),
        (ArgSchema::None, Some(_)) => err!(RuleArgument, "{} takes no arguments", spec.name),
        (_, None) => missing(),
        (_, Some(a)) if a.is_empty() => missing(),
        (ArgSchema::Expr, Some(_)) => Ok(()),
        (ArgSchema::TypeName, Some(a)) => {
            if a.chars().all(|c| c.is_ascii_alphanumeric() || " _*[];:".contains(c)) {
                Ok(())
            } else {
                err!(RuleArgument, "{}: bad type name: '{}'", spec.name, a)
            }
        }
        (ArgSchema::NameList, Some(a)) => parse_name_list(a).map(|_| ()).map_err(|e| error!(RuleArgument, "{}: {}", spec.name, e.message)),
        (ArgSchema::Ident, Some(a)) if is_ident(a) => Ok(()),
        (ArgSchema::Ident, Some(a)) => err!(RuleArgument, "{}: expected field name, got '{}'", spec.name, a),
        (ArgSchema::Template, Some(a)) if a.contains('$') => Ok(()),
        (ArgSchema::Template, Some(_)) => err!(RuleArgument, "{}: expression must contain '$'", spec.name),
    }
}

#[cfg(test)]
mod tests {
    use crate::{*, annotation::*};

    fn names(rules: &[RuleApplication]) -> Vec<String> { rules.iter().map(|a| a.to_text()).collect() }

    #[test]
    fn shapes() {
        let r = RuleRegistry::builtin();
        let rules = parse_annotation("cast(*u64) array(n * (2 + 1)),hex  only(\"a,b\")", r);
        assert_eq!(names(&rules), vec!["cast(*u64)", "array(n * (2 + 1))", "hex", "only(\"a,b\")"]);
        assert!(rules.iter().all(|a| a.arg_error.is_none() && !a.unknown));

        let rules = parse_annotation("frobnicate hex", r);
        assert!(rules[0].unknown && rules[0].is_passthrough());
        assert_eq!(rules[0].rule, r.nop());
        assert!(!rules[1].unknown);

        let rules = parse_annotation("array() hex(3) list(1x) cast(u8\"x\") wrap(foo)", r);
        assert_eq!(rules.len(), 5);
        assert!(rules.iter().all(|a| a.arg_error.as_ref().map_or(false, |e| e.is_rule_argument())), "{:?}", rules);

        // Unbalanced: the error stays with the application, earlier ones are fine.
        let rules = parse_annotation("hex array((n]", r);
        assert_eq!(rules.len(), 2);
        assert!(rules[0].arg_error.is_none());
        assert!(rules[1].arg_error.as_ref().unwrap().is_rule_argument());
        let rules = parse_annotation("hex array(n", r);
        assert_eq!(rules[1].args_str(), "n");
        assert!(rules[1].arg_error.is_some());

        let rules = parse_annotation("wrap(f(\")\", $))", r);
        assert_eq!(rules[0].args_str(), "f(\")\", $)");
        assert!(rules[0].arg_error.is_none());

        let rules = parse_annotation("!!! , ", r);
        assert_eq!(rules.len(), 1);
        assert!(rules[0].unknown);

        assert_eq!(parse_name_list("\"a, b\"").unwrap(), vec!["a", "b"]);
        assert_eq!(parse_name_list("x").unwrap(), vec!["x"]);
        assert_eq!(parse_name_list("0, y").unwrap(), vec!["0", "y"]);
        assert!(parse_name_list("a,,b").is_err());
        assert!(parse_annotation("", r).is_empty());
    }

    #[test]
    fn random_input_never_panics() {
        let r = RuleRegistry::builtin();
        let alphabet: Vec<char> = "ahexry(),\"' []{}$*_1é".chars().collect();
        for _ in 0..5000 {
            let len = rand::random::<usize>() % 24;
            let s: String = (0..len).map(|_| alphabet[rand::random::<usize>() % alphabet.len()]).collect();
            for a in parse_annotation(&s, r) {
                assert!(!a.name.is_empty());
                assert!(a.unknown || r.find(&a.name).is_some());
            }
        }
    }
}

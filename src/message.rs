use std::collections::BTreeMap;

/// A log message as seen by destination drivers: an ordered set of name-value
/// pairs. The upstream pipeline owns parsing and enrichment; by the time a
/// message reaches a destination queue it's just data to be rendered.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    values: BTreeMap<String, String>,
}

impl Message {
    pub fn new() -> Message {
        Message {
            values: BTreeMap::new(),
        }
    }

    pub fn set_value(&mut self, name: &str, value: &str) {
        let _ = self.values.insert(name.to_owned(), value.to_owned());
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|s| s.as_str())
    }

    /// Byte footprint attributed to this message by the `memory_usage`
    /// gauge. An estimate, not an allocation measurement.
    pub fn approx_size(&self) -> usize {
        self.values
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum()
    }
}

/// A compiled message template.
///
/// Supports literal text, `$NAME` and `${NAME}` references into the
/// message's values, `$$` for a literal dollar sign, and the special
/// `${SEQNUM}` reference which renders the delivery attempt ordinal passed
/// in by the worker. Unknown references render as empty strings, which
/// mirrors how the wider pipeline treats unset values.
#[derive(Clone, Debug)]
pub struct Template {
    source: String,
    parts:  Vec<Part>,
}

impl Template {
    pub fn compile(source: &str) -> Template {
        let mut parts = vec![];
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '$' {
                literal.push(c);
                continue;
            }

            match chars.peek().cloned() {
                Some('$') => {
                    let _ = chars.next();
                    literal.push('$');
                }
                Some('{') => {
                    let _ = chars.next();
                    let mut name = String::new();
                    let mut closed = false;
                    while let Some(c) = chars.next() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if closed {
                        flush_literal(&mut parts, &mut literal);
                        parts.push(Part::reference(name));
                    } else {
                        // Unterminated reference renders as it was written.
                        literal.push_str("${");
                        literal.push_str(&name);
                    }
                }
                Some(c) if is_name_char(c) => {
                    let mut name = String::new();
                    while let Some(&c) = chars.peek() {
                        if !is_name_char(c) {
                            break;
                        }
                        name.push(c);
                        let _ = chars.next();
                    }
                    flush_literal(&mut parts, &mut literal);
                    parts.push(Part::reference(name));
                }
                _ => literal.push('$'),
            }
        }
        flush_literal(&mut parts, &mut literal);

        Template {
            source: source.to_owned(),
            parts:  parts,
        }
    }

    /// The text the template was compiled from. Driver identity strings
    /// (persist and stats names) are built from this rather than from a
    /// rendered value.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, msg: &Message, seq_num: u64) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match *part {
                Part::Literal(ref s) => out.push_str(s),
                Part::Value(ref name) => {
                    if let Some(value) = msg.value(name) {
                        out.push_str(value);
                    }
                }
                Part::SeqNum => out.push_str(&seq_num.to_string()),
            }
        }
        out
    }
}

//
// Private types
//

#[derive(Clone, Debug)]
enum Part {
    Literal(String),
    Value(String),
    SeqNum,
}

impl Part {
    fn reference(name: String) -> Part {
        if name == "SEQNUM" {
            Part::SeqNum
        } else {
            Part::Value(name)
        }
    }
}

//
// Private functions
//

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn flush_literal(parts: &mut Vec<Part>, literal: &mut String) {
    if !literal.is_empty() {
        parts.push(Part::Literal(literal.clone()));
        literal.clear();
    }
}

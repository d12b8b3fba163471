//! Line parser.
//!
//! ```text
//! # comment
//! java/lang/Object id: 0
//! app/Plugin id: 7 super: 0 interfaces: 3 4 source: /opt/plugins/p.jar
//! @lambda-proxy app/Main run ()Ljava/lang/Runnable; ()V REF_invokeStatic app/Main lambda$main$0 ()V ()V
//! @lambda-form-invoker [LF_RESOLVE] java.lang.invoke.DirectMethodHandle$Holder invokeStatic L_L
//! @cp app/Main 2 9 14
//! @class-reflection-data app/Main 3
//! ```

use crate::diagnostic::Diagnostic;
use crate::{
    ClassListError, CLASS_REFLECTION_DATA_TAG, CONSTANT_POOL_TAG, LAMBDA_FORM_TAG, LAMBDA_PROXY_TAG,
};
use aho_corasick::AhoCorasick;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

pub const MAX_ALLOWED_LINE_LEN: usize = 256 * 1024;

/// Class names the class-list writer emits but that can never be found by a
/// built-in loader.
const IGNORED_CLASS_PATTERNS: [&str; 2] = ["/$Proxy", "MethodHandle$Species_"];

fn ignored_classes() -> Option<&'static AhoCorasick> {
    static AUTOMATON: OnceLock<Option<AhoCorasick>> = OnceLock::new();
    AUTOMATON
        .get_or_init(|| AhoCorasick::new(IGNORED_CLASS_PATTERNS).ok())
        .as_ref()
}

/// Whether a missing `name` is expected and must not be reported.
pub fn is_ignored_class(name: &str) -> bool {
    match ignored_classes() {
        Some(ac) => ac.is_match(name),
        None => IGNORED_CLASS_PATTERNS.iter().any(|p| name.contains(p)),
    }
}

/// A plain line: a class to load, or an unregistered class when `source` is
/// present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassEntry {
    pub name: String,
    pub id: Option<u32>,
    pub super_id: Option<u32>,
    pub interfaces: Vec<u32>,
    pub source: Option<String>,
}

impl ClassEntry {
    pub fn is_unregistered(&self) -> bool {
        self.source.is_some()
    }
}

/// One constant-pool index of an `@cp` line, with its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpRequest {
    pub index: u32,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassListLine {
    Class(ClassEntry),
    /// Caller class followed by the call-site description items.
    LambdaProxy { class: String, items: Vec<String> },
    LambdaFormInvoker(String),
    ConstantPool { class: String, requests: Vec<CpRequest> },
    ReflectionData { class: String, flags: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub line_no: usize,
    /// The line after whitespace folding.
    pub text: String,
    pub kind: ClassListLine,
}

impl ParsedLine {
    pub fn diagnostic(&self, file: &str, column: usize, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(file, self.line_no, &self.text, column, message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassList {
    pub file: String,
    pub lines: Vec<ParsedLine>,
    /// Text after each `@lambda-form-invoker` tag, in order.
    pub lambda_form_invokers: Vec<String>,
}

impl ClassList {
    pub fn classes(&self) -> impl Iterator<Item = (&ParsedLine, &ClassEntry)> {
        self.lines.iter().filter_map(|l| match &l.kind {
            ClassListLine::Class(e) => Some((l, e)),
            _ => None,
        })
    }

    pub fn class_count(&self) -> usize {
        self.classes().count()
    }
}

/// Cursor over one folded line.
struct Cursor<'a> {
    file: &'a str,
    line_no: usize,
    line: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        &self.line[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.line.len()
    }

    fn error(&self, message: impl Into<String>) -> ClassListError {
        ClassListError::Parse(Diagnostic::new(self.file, self.line_no, self.line, self.pos, message))
    }

    fn skip_whitespaces(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start_matches(' ').len();
    }

    fn skip_non_whitespaces(&mut self) {
        self.pos += self.rest().find(' ').unwrap_or(self.rest().len());
    }

    /// Next whitespace-delimited token.
    fn token(&mut self) -> &'a str {
        self.skip_whitespaces();
        let start = self.pos;
        self.skip_non_whitespaces();
        &self.line[start..self.pos]
    }

    fn skip_token(&mut self, prefix: &str) -> bool {
        if self.rest().starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    /// C-style integer prefix: optional sign, then hex (`0x`), octal (`0`) or
    /// decimal digits. The rest of the token is skipped.
    fn try_parse_int(&mut self) -> Option<i64> {
        self.skip_whitespaces();
        let rest = self.rest();
        let (negative, digits) = match rest.as_bytes().first() {
            Some(b'-') => (true, &rest[1..]),
            Some(b'+') => (false, &rest[1..]),
            _ => (false, rest),
        };
        let (radix, body) = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            (16, hex)
        } else if digits.len() > 1 && digits.starts_with('0') {
            (8, &digits[1..])
        } else {
            (10, digits)
        };
        let end = body.find(|c: char| !c.is_digit(radix)).unwrap_or(body.len());
        let value = if end == 0 {
            // A lone "0" before a non-octal digit still reads as zero.
            if radix == 8 {
                0
            } else {
                return None;
            }
        } else {
            i64::from_str_radix(&body[..end], radix).ok()?
        };
        self.skip_non_whitespaces();
        Some(if negative { -value } else { value })
    }

    fn parse_uint(&mut self) -> Result<u32, ClassListError> {
        let value = self
            .try_parse_int()
            .ok_or_else(|| self.error("Error: expected integer"))?;
        if value < 0 {
            return Err(self.error(format!("Error: negative integers not allowed ({value})")));
        }
        u32::try_from(value).map_err(|_| self.error("Error: expected integer"))
    }
}

/// Parses class-list lines, remembering the ids declared so far.
#[derive(Debug)]
pub struct ClassListParser {
    file: String,
    ids: HashMap<u32, String>,
    lambda_form_invokers: Vec<String>,
}

impl ClassListParser {
    pub fn new(file: &str) -> Self {
        Self {
            file: file.to_string(),
            ids: HashMap::new(),
            lambda_form_invokers: Vec::new(),
        }
    }

    pub fn parse_file(path: &Path) -> Result<ClassList, ClassListError> {
        let text = std::fs::read_to_string(path)?;
        info!(target: "classlist", "Parsing {}", path.display());
        Self::new(&path.display().to_string()).parse_str(&text)
    }

    pub fn parse_str(mut self, text: &str) -> Result<ClassList, ClassListError> {
        let mut lines = Vec::new();
        for (i, raw) in text.split('\n').enumerate() {
            if let Some(line) = self.parse_line(i + 1, raw)? {
                lines.push(line);
            }
        }
        debug!(target: "classlist", "{}: {} entries", self.file, lines.len());
        Ok(ClassList {
            file: self.file,
            lines,
            lambda_form_invokers: self.lambda_form_invokers,
        })
    }

    /// Parses one raw line. Comments and blank lines yield `None`.
    pub fn parse_line(&mut self, line_no: usize, raw: &str) -> Result<Option<ParsedLine>, ClassListError> {
        if raw.len() > MAX_ALLOWED_LINE_LEN {
            return Err(ClassListError::Parse(Diagnostic::new(
                &self.file,
                line_no,
                "",
                0,
                format!("input line too long (must be no longer than {MAX_ALLOWED_LINE_LEN} chars)"),
            )));
        }
        if raw.starts_with('#') {
            return Ok(None);
        }
        let folded: String = raw
            .chars()
            .map(|c| if matches!(c, '\t' | '\r' | '\n' | '\u{c}') { ' ' } else { c })
            .collect();
        let text = folded.trim_end_matches(' ');
        if text.is_empty() {
            return Ok(None);
        }
        let mut cur = Cursor {
            file: &self.file,
            line_no,
            line: text,
            pos: 0,
        };
        let kind = if text.starts_with('@') {
            let (kind, invoker) = parse_at_tag(&mut cur)?;
            if let Some(invoker) = invoker {
                self.lambda_form_invokers.push(invoker);
            }
            kind
        } else {
            let entry = parse_class_line(&mut cur, &self.ids)?;
            if let Some(id) = entry.id {
                if self.ids.insert(id, entry.name.clone()).is_some() {
                    cur.pos = 0;
                    return Err(cur.error(format!("Duplicated ID {id} for class {}", entry.name)));
                }
            }
            ClassListLine::Class(entry)
        };
        Ok(Some(ParsedLine {
            line_no,
            text: text.to_string(),
            kind,
        }))
    }
}

fn parse_class_line(cur: &mut Cursor<'_>, ids: &HashMap<u32, String>) -> Result<ClassEntry, ClassListError> {
    let mut entry = ClassEntry {
        name: cur.token().to_string(),
        ..ClassEntry::default()
    };
    let check_defined = |cur: &Cursor<'_>, id: u32| {
        if ids.contains_key(&id) {
            Ok(())
        } else {
            Err(cur.error(format!("Class ID {id} has not been defined")))
        }
    };
    let mut interfaces_specified = false;
    while !cur.at_end() {
        cur.skip_whitespaces();
        if cur.skip_token("id:") {
            if entry.id.is_some() {
                return Err(cur.error("id: specified twice"));
            }
            entry.id = Some(cur.parse_uint()?);
        } else if cur.skip_token("super:") {
            if entry.super_id.is_some() {
                return Err(cur.error("super: specified twice"));
            }
            let id = cur.parse_uint()?;
            check_defined(cur, id)?;
            entry.super_id = Some(id);
        } else if cur.skip_token("interfaces:") {
            interfaces_specified = true;
            loop {
                let save = cur.pos;
                match cur.try_parse_int() {
                    Some(v) if v >= 0 => {
                        let id = u32::try_from(v).map_err(|_| cur.error("Error: expected integer"))?;
                        check_defined(cur, id)?;
                        entry.interfaces.push(id);
                    }
                    Some(v) => return Err(cur.error(format!("Error: negative integers not allowed ({v})"))),
                    None => {
                        cur.pos = save;
                        break;
                    }
                }
            }
        } else if cur.skip_token("source:") {
            let source = cur.token();
            if source.is_empty() {
                return Err(cur.error("Unknown input"));
            }
            entry.source = Some(source.to_string());
        } else {
            return Err(cur.error("Unknown input"));
        }
    }

    cur.pos = 0;
    if entry.is_unregistered() {
        if entry.super_id.is_none() {
            return Err(cur.error("If source location is specified, super class must be also specified"));
        }
        if entry.id.is_none() {
            return Err(cur.error("If source location is specified, id must be also specified"));
        }
    } else {
        if entry.super_id.is_some() {
            return Err(cur.error("If source location is not specified, super class must not be specified"));
        }
        if interfaces_specified {
            return Err(cur.error("If source location is not specified, interface(s) must not be specified"));
        }
    }
    Ok(entry)
}

/// Parses an `@` line. The second value is the text of a lambda-form-invoker
/// line.
fn parse_at_tag(cur: &mut Cursor<'_>) -> Result<(ClassListLine, Option<String>), ClassListError> {
    let line = cur.line;
    let Some(space) = line.find(' ') else {
        return Err(cur.error(format!(
            "Too few items following the @ tag \"{}\" line #{}",
            line, cur.line_no
        )));
    };
    let tag = &line[..space];
    cur.pos = space;
    cur.skip_whitespaces();

    match tag {
        LAMBDA_PROXY_TAG => {
            let items: Vec<String> = cur.rest().split_whitespace().map(str::to_string).collect();
            if items.len() < 2 {
                return Err(cur.error(format!(
                    "Line with @ tag has too few items \"{}\" line #{}",
                    tag, cur.line_no
                )));
            }
            let mut items = items.into_iter();
            let class = items.next().unwrap_or_default();
            Ok((
                ClassListLine::LambdaProxy {
                    class,
                    items: items.collect(),
                },
                None,
            ))
        }
        LAMBDA_FORM_TAG => {
            let text = cur.rest().to_string();
            Ok((ClassListLine::LambdaFormInvoker(text.clone()), Some(text)))
        }
        CONSTANT_POOL_TAG => {
            let class = cur.token().to_string();
            let mut requests = Vec::new();
            loop {
                cur.skip_whitespaces();
                if cur.at_end() {
                    break;
                }
                let column = cur.pos;
                let index = cur.parse_uint()?;
                requests.push(CpRequest { index, column });
            }
            Ok((ClassListLine::ConstantPool { class, requests }, None))
        }
        CLASS_REFLECTION_DATA_TAG => {
            let class = cur.token().to_string();
            let mut flags = None;
            loop {
                cur.skip_whitespaces();
                if cur.at_end() {
                    break;
                }
                if flags.is_some() {
                    return Err(cur.error("rd_flags specified twice"));
                }
                flags = Some(cur.parse_uint()?);
            }
            let flags = flags.ok_or_else(|| cur.error("no rd_flags specified"))?;
            Ok((ClassListLine::ReflectionData { class, flags }, None))
        }
        _ => {
            cur.pos = 0;
            Err(cur.error(format!(
                "Invalid @ tag at the beginning of line \"{}\" line #{}",
                tag, cur.line_no
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<ClassList, ClassListError> {
        ClassListParser::new("test.classlist").parse_str(text)
    }

    fn parse_err(text: &str) -> Diagnostic {
        match parse(text) {
            Err(ClassListError::Parse(d)) => d,
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_full_list() {
        let list = parse(
            "# generated\n\
             java/lang/Object id: 0\n\
             \n\
             app/Api\tid: 3\r\n\
             app/Plugin id: 7 super: 0 interfaces: 3 source: /opt/p.jar   \n\
             @lambda-proxy app/Main run ()Ljava/lang/Runnable; ()V 6 app/Main lambda$main$0 ()V ()V\n\
             @lambda-form-invoker [LF_RESOLVE] java.lang.invoke.Invokers$Holder invoker L_L\n\
             @cp app/Main 2 0x9 014\n\
             @class-reflection-data app/Main 3\n",
        )
        .unwrap();
        assert_eq!(list.class_count(), 3);
        let (_, plugin) = list.classes().nth(2).unwrap();
        assert_eq!(
            plugin,
            &ClassEntry {
                name: "app/Plugin".to_string(),
                id: Some(7),
                super_id: Some(0),
                interfaces: vec![3],
                source: Some("/opt/p.jar".to_string()),
            }
        );
        assert!(plugin.is_unregistered());

        let cp = list
            .lines
            .iter()
            .find_map(|l| match &l.kind {
                ClassListLine::ConstantPool { class, requests } => Some((class.clone(), requests.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(cp.0, "app/Main");
        assert_eq!(cp.1.iter().map(|r| r.index).collect::<Vec<_>>(), vec![2, 9, 12]);
        assert_eq!(cp.1[0].column, 13);

        assert!(list.lines.iter().any(|l| matches!(
            &l.kind,
            ClassListLine::LambdaProxy { class, items } if class == "app/Main" && items.len() == 8
        )));
        assert_eq!(
            list.lambda_form_invokers,
            vec!["[LF_RESOLVE] java.lang.invoke.Invokers$Holder invoker L_L".to_string()]
        );
        assert!(list
            .lines
            .iter()
            .any(|l| l.kind == ClassListLine::ReflectionData { class: "app/Main".to_string(), flags: 3 }));
    }

    #[test]
    fn test_option_errors() {
        let d = parse_err("app/A id: 1 id: 2\n");
        assert_eq!(d.message, "id: specified twice");
        assert_eq!(d.column, 15);

        let d = parse_err("app/A id: x\n");
        assert_eq!(d.message, "Error: expected integer");

        let d = parse_err("app/A id: -4\n");
        assert_eq!(d.message, "Error: negative integers not allowed (-4)");

        let d = parse_err("app/A color: red\n");
        assert_eq!(d.message, "Unknown input");
        assert_eq!(d.column, 6);
        assert!(d.to_string().contains("app/A color: red\n      ^\n"));
    }

    #[test]
    fn test_source_rules() {
        let d = parse_err("app/A source: a.jar\n");
        assert_eq!(d.message, "If source location is specified, super class must be also specified");

        let d = parse_err("java/lang/Object id: 0\napp/A super: 0 source: a.jar\n");
        assert_eq!(d.message, "If source location is specified, id must be also specified");
        assert_eq!(d.line_no, 2);

        let d = parse_err("java/lang/Object id: 0\napp/A id: 1 super: 0\n");
        assert_eq!(d.message, "If source location is not specified, super class must not be specified");

        let d = parse_err("app/A id: 1 super: 5 source: a.jar\n");
        assert_eq!(d.message, "Class ID 5 has not been defined");

        let d = parse_err("java/lang/Object id: 0\napp/A id: 0\n");
        assert_eq!(d.message, "Duplicated ID 0 for class app/A");
    }

    #[test]
    fn test_at_tag_errors() {
        let d = parse_err("@cp\n");
        assert_eq!(d.message, "Too few items following the @ tag \"@cp\" line #1");

        let d = parse_err("@lambda-proxy app/Main\n");
        assert_eq!(d.message, "Line with @ tag has too few items \"@lambda-proxy\" line #1");

        let d = parse_err("@bogus x\n");
        assert_eq!(d.message, "Invalid @ tag at the beginning of line \"@bogus\" line #1");

        let d = parse_err("@class-reflection-data app/Main\n");
        assert_eq!(d.message, "no rd_flags specified");

        let d = parse_err("@class-reflection-data app/Main 1 2\n");
        assert_eq!(d.message, "rd_flags specified twice");

        let d = parse_err("@cp app/Main 3 four\n");
        assert_eq!(d.message, "Error: expected integer");
    }

    #[test]
    fn test_line_too_long() {
        let long = "a".repeat(MAX_ALLOWED_LINE_LEN + 1);
        let d = parse_err(&long);
        assert!(d.message.starts_with("input line too long"));
    }

    #[test]
    fn test_ignored_classes() {
        assert!(is_ignored_class("com/sun/proxy/$Proxy12"));
        assert!(is_ignored_class("java/lang/invoke/BoundMethodHandle$Species_LL"));
        assert!(!is_ignored_class("app/Main"));
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.classlist");
        std::fs::write(&path, "java/lang/Object\napp/Main\n").unwrap();
        let list = ClassListParser::parse_file(&path).unwrap();
        assert_eq!(list.class_count(), 2);
        assert!(list.file.ends_with("app.classlist"));
    }
}

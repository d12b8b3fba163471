//! Per-method precompile directives.
//!
//! A directive is `Command,Pattern` where the pattern is `Class::method` and
//! either part may use `*` to match any run of characters:
//!
//! ```text
//! DontPrecompile,app/Main::slow*
//! PrecompileRecorded=2,java/util/*::hash*
//! ```

use crate::PrecompileError;
use common::{CdsConfig, MethodId, Runtime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    DontPrecompile,
    /// Compile at the given level even when the method has no usable record.
    PrecompileRecorded(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodPattern {
    class: String,
    method: String,
}

impl MethodPattern {
    pub fn parse(pattern: &str) -> Result<Self, PrecompileError> {
        let (class, method) = pattern
            .split_once("::")
            .ok_or_else(|| PrecompileError::BadPattern(pattern.to_string()))?;
        if class.is_empty() || method.is_empty() {
            return Err(PrecompileError::BadPattern(pattern.to_string()));
        }
        Ok(Self {
            class: class.replace('.', "/"),
            method: method.to_string(),
        })
    }

    pub fn matches(&self, class: &str, method: &str) -> bool {
        wildcard_match(&self.class, class) && wildcard_match(&self.method, method)
    }
}

/// Glob match where `*` matches any run of characters, including none.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let (p, t) = (pattern.as_bytes(), text.as_bytes());
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub kind: DirectiveKind,
    pub pattern: MethodPattern,
}

impl Directive {
    pub fn parse(command: &str) -> Result<Self, PrecompileError> {
        let (head, pattern) = command
            .split_once(',')
            .ok_or_else(|| PrecompileError::BadValue(command.to_string()))?;
        let kind = match head.split_once('=') {
            None if head == "DontPrecompile" => DirectiveKind::DontPrecompile,
            Some(("PrecompileRecorded", level)) => {
                let level: u8 = level
                    .parse()
                    .map_err(|_| PrecompileError::BadValue(command.to_string()))?;
                if level > crate::COMP_LEVEL_FULL_OPTIMIZATION {
                    return Err(PrecompileError::BadValue(command.to_string()));
                }
                DirectiveKind::PrecompileRecorded(level)
            }
            _ => return Err(PrecompileError::UnknownDirective(head.to_string())),
        };
        Ok(Self {
            kind,
            pattern: MethodPattern::parse(pattern.trim())?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    directives: Vec<Directive>,
}

impl Directives {
    pub fn new(directives: Vec<Directive>) -> Self {
        Self { directives }
    }

    pub fn from_config(config: &CdsConfig) -> Result<Self, PrecompileError> {
        let directives = config
            .compile_command
            .iter()
            .map(|c| Directive::parse(c))
            .collect::<Result<_, _>>()?;
        Ok(Self { directives })
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    fn matching(&self, rt: &Runtime, m: MethodId) -> impl Iterator<Item = &Directive> + '_ {
        let target = rt
            .method(m)
            .map(|method| (rt.klasses.name(method.holder).to_string(), method.name.clone()));
        self.directives.iter().filter(move |d| {
            target
                .as_ref()
                .is_some_and(|(class, name)| d.pattern.matches(class, name))
        })
    }

    pub fn dont_precompile(&self, rt: &Runtime, m: MethodId) -> bool {
        self.matching(rt, m)
            .any(|d| d.kind == DirectiveKind::DontPrecompile)
    }

    /// Level of the first matching `PrecompileRecorded` directive, or 0.
    pub fn precompile_recorded(&self, rt: &Runtime, m: MethodId) -> u8 {
        self.matching(rt, m)
            .find_map(|d| match d.kind {
                DirectiveKind::PrecompileRecorded(level) => Some(level),
                DirectiveKind::DontPrecompile => None,
            })
            .unwrap_or(0)
    }
}

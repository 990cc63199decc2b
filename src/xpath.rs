/// XPath Subset Module
///
/// This module implements the location-path subset the engine needs: absolute
/// paths of qualified steps with optional key-equality, positional, or opaque
/// predicates, plus the static disjointness check that lets the operational
/// composer skip provider callouts whose subscription cannot intersect the
/// request.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ErrorKind, StoreError, StoreResult};

/// A single location step: optional module qualifier, node name (or `*`),
/// and zero or more predicates. `descendant` marks a step introduced by `//`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub module: Option<String>,
    pub name: String,
    pub descendant: bool,
    pub predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    /// `[key='value']` — equality on a list key
    KeyEq { key: String, value: String },
    /// `[3]` — positional selection
    Position(usize),
    /// Anything else; treated as opaque and conservatively matching
    Other(String),
}

/// An absolute location path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XPath {
    steps: Vec<Step>,
}

impl XPath {
    /// Parse an absolute location path. Returns `InvalArg` on malformed input.
    pub fn parse(input: &str) -> StoreResult<XPath> {
        if !input.starts_with('/') {
            return Err(StoreError::new(
                ErrorKind::InvalArg,
                format!("xpath '{}' is not absolute", input),
            ));
        }

        let mut steps = Vec::new();
        let mut rest = &input[1..];
        let mut descendant = false;

        while !rest.is_empty() {
            if let Some(stripped) = rest.strip_prefix('/') {
                // An empty segment means we just consumed the second slash
                // of a `//` descendant marker.
                descendant = true;
                rest = stripped;
                continue;
            }

            let (segment, remainder) = split_step(rest)?;
            let step = parse_step(segment, descendant)
                .map_err(|e| e.with_path(input.to_string()))?;
            steps.push(step);
            descendant = false;
            rest = remainder;
        }

        if steps.is_empty() {
            return Err(StoreError::new(
                ErrorKind::InvalArg,
                format!("xpath '{}' has no steps", input),
            ));
        }
        Ok(XPath { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of location steps.
    pub fn depth(&self) -> usize {
        self.steps.len()
    }

    /// Module qualifier of the first step, when present.
    pub fn first_module(&self) -> Option<&str> {
        self.steps[0].module.as_deref()
    }

    /// The path with the trailing step removed; `None` for a single step.
    pub fn parent(&self) -> Option<XPath> {
        if self.steps.len() <= 1 {
            return None;
        }
        Some(XPath {
            steps: self.steps[..self.steps.len() - 1].to_vec(),
        })
    }

    /// Schema path of this location path: step names without predicates,
    /// e.g. `/interfaces/interface/oper-state`.
    pub fn schema_path(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            out.push('/');
            out.push_str(&step.name);
        }
        out
    }
}

impl fmt::Display for XPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            if step.descendant {
                f.write_str("/")?;
            }
            f.write_str("/")?;
            if let Some(module) = &step.module {
                write!(f, "{}:", module)?;
            }
            f.write_str(&step.name)?;
            for pred in &step.predicates {
                match pred {
                    Predicate::KeyEq { key, value } => write!(f, "[{}='{}']", key, value)?,
                    Predicate::Position(pos) => write!(f, "[{}]", pos)?,
                    Predicate::Other(expr) => write!(f, "[{}]", expr)?,
                }
            }
        }
        Ok(())
    }
}

/// Split one step off the front of `rest`, honoring brackets. Returns the
/// step text and the remainder (without the separating slash).
fn split_step(rest: &str) -> StoreResult<(&str, &str)> {
    let mut in_bracket = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in rest.char_indices() {
        match c {
            '\'' | '"' => match quote {
                Some(q) if q == c => quote = None,
                None if in_bracket > 0 => quote = Some(c),
                _ => {}
            },
            '[' if quote.is_none() => in_bracket += 1,
            ']' if quote.is_none() => {
                if in_bracket == 0 {
                    return Err(StoreError::new(ErrorKind::InvalArg, "unbalanced ']' in xpath"));
                }
                in_bracket -= 1;
            }
            '/' if in_bracket == 0 && quote.is_none() => {
                return Ok((&rest[..i], &rest[i + 1..]));
            }
            _ => {}
        }
    }
    if in_bracket != 0 || quote.is_some() {
        return Err(StoreError::new(ErrorKind::InvalArg, "unterminated predicate in xpath"));
    }
    Ok((rest, ""))
}

fn parse_step(segment: &str, descendant: bool) -> StoreResult<Step> {
    let (qname, preds) = match segment.find('[') {
        Some(idx) => (&segment[..idx], &segment[idx..]),
        None => (segment, ""),
    };
    if qname.is_empty() {
        return Err(StoreError::new(ErrorKind::InvalArg, "empty step in xpath"));
    }

    let (module, name) = match qname.split_once(':') {
        Some((m, n)) => (Some(m.to_string()), n.to_string()),
        None => (None, qname.to_string()),
    };
    if name.is_empty() {
        return Err(StoreError::new(ErrorKind::InvalArg, "empty node name in xpath step"));
    }

    let mut predicates = Vec::new();
    let mut rest = preds;
    while let Some(stripped) = rest.strip_prefix('[') {
        let end = find_bracket_end(stripped)?;
        predicates.push(parse_predicate(&stripped[..end]));
        rest = &stripped[end + 1..];
    }
    if !rest.is_empty() {
        return Err(StoreError::new(
            ErrorKind::InvalArg,
            format!("trailing garbage '{}' in xpath step", rest),
        ));
    }

    Ok(Step {
        module,
        name,
        descendant,
        predicates,
    })
}

fn find_bracket_end(s: &str) -> StoreResult<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match c {
            '\'' | '"' => match quote {
                Some(q) if q == c => quote = None,
                None => quote = Some(c),
                _ => {}
            },
            ']' if quote.is_none() => return Ok(i),
            _ => {}
        }
    }
    Err(StoreError::new(ErrorKind::InvalArg, "unterminated predicate in xpath"))
}

fn parse_predicate(body: &str) -> Predicate {
    let body = body.trim();
    if let Ok(pos) = body.parse::<usize>() {
        return Predicate::Position(pos);
    }
    if let Some((key, value)) = body.split_once('=') {
        let key = key.trim();
        let value = value.trim();
        let quoted = (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
            || (value.starts_with('"') && value.ends_with('"') && value.len() >= 2);
        if quoted && !key.is_empty() && !key.contains(|c: char| "[]<>!".contains(c)) {
            return Predicate::KeyEq {
                key: key.to_string(),
                value: value[1..value.len() - 1].to_string(),
            };
        }
    }
    Predicate::Other(body.to_string())
}

/// Static disjointness check between a request path and a subscription path.
///
/// Walks both paths step by step. A disagreement on node name, or on module
/// qualifier, at equal depth between non-wildcard steps proves the paths are
/// disjoint. A predicate pair rules the paths out only when both sides pin
/// the same key to different literals. `//` on either side is conservatively
/// treated as overlapping. Returns `true` when an overlap cannot be excluded.
pub fn paths_overlap(request: &XPath, sub: &XPath) -> bool {
    let mut req_module: Option<&str> = None;
    let mut sub_module: Option<&str> = None;

    let common = request.steps().len().min(sub.steps().len());
    for i in 0..common {
        let rs = &request.steps()[i];
        let ss = &sub.steps()[i];

        if rs.descendant || ss.descendant {
            return true;
        }
        if let Some(m) = rs.module.as_deref() {
            req_module = Some(m);
        }
        if let Some(m) = ss.module.as_deref() {
            sub_module = Some(m);
        }

        let wildcard = rs.name == "*" || ss.name == "*";
        if !wildcard {
            if rs.name != ss.name {
                return false;
            }
            if let (Some(rm), Some(sm)) = (req_module, sub_module) {
                if rm != sm {
                    return false;
                }
            }
        }

        for rp in &rs.predicates {
            if let Predicate::KeyEq { key: rk, value: rv } = rp {
                for sp in &ss.predicates {
                    if let Predicate::KeyEq { key: sk, value: sv } = sp {
                        if rk == sk && rv != sv {
                            return false;
                        }
                    }
                }
            }
        }
    }
    true
}

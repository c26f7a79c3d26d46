//! Value-reference expressions.
//!
//! `$(instance.inputs|outputs.field)` evaluates against the live registry;
//! `$cdk(instance.tile.field)` renders a compile-time dotted reference for
//! generated infra-as-code. Unresolvable expressions stay literal and are
//! logged. Substitution passes are bounded by the number of `$` in the input.

use super::error::{Error, Result};
use super::registry::{tile_variable, Registry};
use indexmap::IndexMap;
use regex::{Captures, Regex};
use std::sync::LazyLock;

#[allow(clippy::unwrap_used)]
static VALUE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\(([\w-]+)\.(inputs|outputs)\.([\w-]+)\)").unwrap());

#[allow(clippy::unwrap_used)]
static CDK_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$cdk\(([\w-]+)\.([\w-]+)\.([\w-]+)\)").unwrap());

#[allow(clippy::unwrap_used)]
static EXPORT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^export (.*?)=(.*)$").unwrap());

pub const SELF_TOKEN: &str = "self";

/// Evaluates reference expressions against one run's registry.
pub struct ReferenceResolver<'a> {
    registry: &'a Registry,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Resolve one `$(id.kind.field)` triple.
    pub fn resolve_value(
        &self,
        id: &str,
        kind: &str,
        field: &str,
        context: Option<&str>,
    ) -> Result<String> {
        let expr = format!("$({}.{}.{})", id, kind, field);
        if id == SELF_TOKEN {
            return match context {
                Some(ctx) => self.lookup(ctx, kind, field, &expr),
                None => self.scan(kind, field, &expr),
            };
        }
        self.lookup(id, kind, field, &expr)
    }

    fn lookup(&self, id: &str, kind: &str, field: &str, expr: &str) -> Result<String> {
        let value = match kind {
            "inputs" => self
                .registry
                .stack(id)
                .and_then(|s| s.input(field))
                .filter(|v| !v.is_empty()),
            "outputs" => self.registry.outputs(id).and_then(|o| o.value(field)),
            other => {
                return Err(Error::Reference {
                    expr: expr.to_string(),
                    reason: format!("unknown section '{}'", other),
                })
            }
        };
        value.map(str::to_string).ok_or_else(|| Error::Reference {
            expr: expr.to_string(),
            reason: if self.registry.contains(id) {
                format!("'{}' has no value for {} '{}'", id, kind, field)
            } else {
                format!("no instance '{}'", id)
            },
        })
    }

    /// Context-free `self`: last instance (registration order) with a value wins.
    fn scan(&self, kind: &str, field: &str, expr: &str) -> Result<String> {
        self.registry
            .nodes()
            .filter_map(|n| self.lookup(&n.instance, kind, field, expr).ok())
            .last()
            .ok_or_else(|| Error::Reference {
                expr: expr.to_string(),
                reason: format!("no instance has a value for {} '{}'", kind, field),
            })
    }

    /// Resolve one `$cdk(id.tile.field)` triple to `stackVar.tileVar.field`.
    pub fn resolve_cdk(
        &self,
        id: &str,
        tile: &str,
        field: &str,
        context: Option<&str>,
    ) -> Result<String> {
        let target = match (id, context) {
            (SELF_TOKEN, Some(ctx)) => ctx,
            _ => id,
        };
        let stack = self.registry.stack(target).ok_or_else(|| Error::Reference {
            expr: format!("$cdk({}.{}.{})", id, tile, field),
            reason: format!("no stack for '{}'", target),
        })?;
        Ok(format!(
            "{}.{}.{}",
            stack.tile_stack_variable,
            tile_variable(tile),
            field
        ))
    }

    /// Substitute every resolvable expression in `text`.
    pub fn substitute(&self, text: &str, context: Option<&str>) -> String {
        self.substitute_counted(text, context).0
    }

    /// Substitute and report how many passes ran.
    pub fn substitute_counted(&self, text: &str, context: Option<&str>) -> (String, usize) {
        let budget = text.matches('$').count();
        let mut current = text.to_string();
        let mut passes = 0;
        while passes < budget {
            passes += 1;
            let (after_values, a) = replace_resolvable(&VALUE_REF, &current, |c| {
                self.resolve_value(&c[1], &c[2], &c[3], context)
            });
            let (after_cdk, b) = replace_resolvable(&CDK_REF, &after_values, |c| {
                self.resolve_cdk(&c[1], &c[2], &c[3], context)
            });
            current = after_cdk;
            if a + b == 0 {
                break;
            }
        }
        self.log_unresolved(&current, context);
        (current, passes)
    }

    fn log_unresolved(&self, text: &str, context: Option<&str>) {
        for caps in VALUE_REF.captures_iter(text) {
            if let Err(e) = self.resolve_value(&caps[1], &caps[2], &caps[3], context) {
                tracing::error!(error = %e, "unresolved reference");
            }
        }
        for caps in CDK_REF.captures_iter(text) {
            if let Err(e) = self.resolve_cdk(&caps[1], &caps[2], &caps[3], context) {
                tracing::error!(error = %e, "unresolved reference");
            }
        }
    }
}

/// One left-to-right pass. Returns the new text and the replacement count.
fn replace_resolvable<F>(re: &Regex, text: &str, mut resolve: F) -> (String, usize)
where
    F: FnMut(&Captures<'_>) -> Result<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut replaced = 0;
    for caps in re.captures_iter(text) {
        let Some(m) = caps.get(0) else { continue };
        if let Ok(value) = resolve(&caps) {
            out.push_str(&text[last..m.start()]);
            out.push_str(&value);
            last = m.end();
            replaced += 1;
        }
    }
    out.push_str(&text[last..]);
    (out, replaced)
}

/// True if `text` still holds a `$()` or `$cdk()` expression.
pub fn has_reference(text: &str) -> bool {
    VALUE_REF.is_match(text) || CDK_REF.is_match(text)
}

// ============================================================================
// Environment substitution
// ============================================================================

/// Flattened `export NAME=VALUE` map used for `$NAME` substitution.
#[derive(Debug, Clone, Default)]
pub struct EnvMap {
    vars: IndexMap<String, String>,
}

impl EnvMap {
    /// Build from injected environment lines; non-export lines are ignored.
    /// Later lines win.
    pub fn from_lines<'l, I>(lines: I) -> Self
    where
        I: IntoIterator<Item = &'l str>,
    {
        let mut vars = IndexMap::new();
        for line in lines {
            if let Some(caps) = EXPORT_LINE.captures(line.trim()) {
                let value = caps[2].trim().trim_matches('"').to_string();
                vars.insert(caps[1].trim().to_string(), value);
            }
        }
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Replace `${NAME}` and `$NAME`, longest names first so prefixes never
    /// clobber longer names.
    pub fn substitute(&self, text: &str) -> String {
        let mut keys: Vec<&String> = self.vars.keys().collect();
        keys.sort_by_key(|k| std::cmp::Reverse(k.len()));
        let mut out = text.to_string();
        for key in keys {
            let value = &self.vars[key];
            out = out.replace(&format!("${{{}}}", key), value);
            out = out.replace(&format!("${}", key), value);
        }
        out
    }
}

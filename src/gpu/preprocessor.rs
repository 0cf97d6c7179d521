//! WGSL preprocessing for embedded shaders
//!
//! Handles `#include "name.wgsl"` against a table of embedded sources and
//! `{{NAME}}` substitution for load-time constants such as thread group sizes.

use std::collections::{HashMap, HashSet};

use crate::error::{program_error, PipelineResult};

pub struct WgslPreprocessor {
    sources: HashMap<&'static str, &'static str>,
    defines: HashMap<String, String>,
}

impl WgslPreprocessor {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            defines: HashMap::new(),
        }
    }

    /// Register an embedded source that can be included by name
    pub fn add_source(&mut self, name: &'static str, source: &'static str) -> &mut Self {
        self.sources.insert(name, source);
        self
    }

    pub fn define(&mut self, name: &str, value: impl ToString) -> &mut Self {
        self.defines.insert(name.to_string(), value.to_string());
        self
    }

    /// Expand includes and substitute defines
    pub fn process(&self, name: &str, content: &str) -> PipelineResult<String> {
        let mut seen = HashSet::new();
        let expanded = self.expand(name, content, &mut seen)?;
        self.substitute(name, &expanded)
    }

    fn expand(&self, name: &str, content: &str, seen: &mut HashSet<String>) -> PipelineResult<String> {
        let mut result = String::with_capacity(content.len());
        for line in content.lines() {
            match Self::parse_include_directive(line) {
                Some(include) => {
                    // Each file is pasted once; repeated includes are skipped
                    if seen.insert(include.clone()) {
                        let source = self.sources.get(include.as_str()).ok_or_else(|| {
                            program_error(name, format!("unknown include '{}'", include))
                        })?;
                        result.push_str(&self.expand(&include, source, seen)?);
                    }
                }
                None => {
                    result.push_str(line);
                    result.push('\n');
                }
            }
        }
        Ok(result)
    }

    fn substitute(&self, name: &str, content: &str) -> PipelineResult<String> {
        let mut result = String::with_capacity(content.len());
        let mut rest = content;
        while let Some(start) = rest.find("{{") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| program_error(name, "unterminated '{{'"))?;
            let key = after[..end].trim();
            let value = self
                .defines
                .get(key)
                .ok_or_else(|| program_error(name, format!("undefined constant '{}'", key)))?;
            result.push_str(value);
            rest = &after[end + 2..];
        }
        result.push_str(rest);
        Ok(result)
    }

    fn parse_include_directive(line: &str) -> Option<String> {
        let after = line.trim().strip_prefix("#include")?.trim();
        after
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
    }
}

impl Default for WgslPreprocessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_include_and_define() {
        let mut pp = WgslPreprocessor::new();
        pp.add_source("common.wgsl", "struct A { x: u32 }");
        pp.define("GROUP_X", 32);

        let out = pp
            .process(
                "main.wgsl",
                "#include \"common.wgsl\"\n#include \"common.wgsl\"\n@workgroup_size({{GROUP_X}}, 1, 1)",
            )
            .unwrap();

        assert_eq!(out.matches("struct A").count(), 1);
        assert!(out.contains("@workgroup_size(32, 1, 1)"));
    }

    #[test]
    fn test_missing_define_is_an_error() {
        let pp = WgslPreprocessor::new();
        assert!(pp.process("main.wgsl", "{{MISSING}}").is_err());
    }

    #[test]
    fn test_missing_include_is_an_error() {
        let pp = WgslPreprocessor::new();
        assert!(pp.process("main.wgsl", "#include \"nope.wgsl\"").is_err());
    }
}

//! FileCheck-style validation for IR test files.
//!
//! A test file is IR text with directives in `;` comments. `RUN:` lines give the driver flags
//! the file is processed with, and `CHECK` lines describe the expected report, similar to
//! LLVM's FileCheck tool.

use crate::driver::{run_module, DriverOptions};

/// A CHECK directive extracted from a test file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckDirective {
    /// CHECK: pattern - Match on this or any later line
    Check(String),
    /// CHECK-LABEL: pattern - Label for a section
    CheckLabel(String),
    /// CHECK-NEXT: pattern - Match on the next line
    CheckNext(String),
    /// CHECK-SAME: pattern - Match on the line of the previous match
    CheckSame(String),
    /// CHECK-NOT: pattern - No line before the next match contains the pattern
    CheckNot(String),
    /// CHECK-EMPTY - Match empty line
    CheckEmpty,
    /// COM: comment - Comment, ignored
    Comment(String),
}

/// A RUN directive specifying how to process the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirective {
    pub command: String,
    pub args: Vec<String>,
}

/// Test specification extracted from a test file
#[derive(Debug)]
pub struct TestSpec {
    pub run_directives: Vec<RunDirective>,
    pub check_directives: Vec<CheckDirective>,
    pub ir_content: String,
}

impl TestSpec {
    /// Split a test file into directives and IR text.
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut run_directives = Vec::new();
        let mut check_directives = Vec::new();
        let mut ir_lines = Vec::new();

        for line in content.lines() {
            let trimmed = line.trim();

            if let Some(run_cmd) = trimmed.strip_prefix("; RUN:") {
                let parts: Vec<&str> = run_cmd
                    .split_whitespace()
                    .filter(|part| *part != "%s")
                    .collect();
                if let Some((command, args)) = parts.split_first() {
                    run_directives.push(RunDirective {
                        command: command.to_string(),
                        args: args.iter().map(|s| s.to_string()).collect(),
                    });
                }
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-LABEL:") {
                check_directives.push(CheckDirective::CheckLabel(pattern.trim().to_string()));
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-NEXT:") {
                check_directives.push(CheckDirective::CheckNext(pattern.trim().to_string()));
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-SAME:") {
                check_directives.push(CheckDirective::CheckSame(pattern.trim().to_string()));
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK-NOT:") {
                check_directives.push(CheckDirective::CheckNot(pattern.trim().to_string()));
            } else if trimmed.starts_with("; CHECK-EMPTY") {
                check_directives.push(CheckDirective::CheckEmpty);
            } else if let Some(pattern) = trimmed.strip_prefix("; CHECK:") {
                check_directives.push(CheckDirective::Check(pattern.trim().to_string()));
            } else if let Some(comment) = trimmed.strip_prefix("; COM:") {
                check_directives.push(CheckDirective::Comment(comment.trim().to_string()));
            } else {
                ir_lines.push(line);
            }
        }

        if run_directives.is_empty() {
            return Err("no RUN directive".to_string());
        }

        Ok(TestSpec {
            run_directives,
            check_directives,
            ir_content: ir_lines.join("\n"),
        })
    }
}

/// Test runner that processes IR test files
pub struct TestRunner {
    verbose: bool,
}

impl TestRunner {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Run every RUN line of `spec` and validate each report.
    pub fn run_test(&self, spec: &TestSpec) -> Result<(), String> {
        for run_dir in &spec.run_directives {
            let output = self.execute_command(&spec.ir_content, run_dir)?;
            if self.verbose {
                println!("{}", output);
            }
            self.validate_output(&output, &spec.check_directives)?;
        }
        Ok(())
    }

    /// Process the IR with the flags of one RUN line.
    fn execute_command(&self, ir: &str, run_dir: &RunDirective) -> Result<String, String> {
        if run_dir.command != "irjit" {
            return Err(format!("unknown RUN command '{}'", run_dir.command));
        }
        let options = DriverOptions::from_args(run_dir.args.iter().map(String::as_str))
            .map_err(|e| e.to_string())?;
        run_module(ir, &options).map_err(|e| e.to_string())
    }

    /// Validate output against CHECK directives
    pub fn validate_output(
        &self,
        output: &str,
        directives: &[CheckDirective],
    ) -> Result<(), String> {
        let output_lines: Vec<&str> = output.lines().collect();
        let mut line_idx = 0;
        let mut forbidden: Vec<&str> = Vec::new();

        for directive in directives {
            match directive {
                CheckDirective::Comment(_) => continue,

                CheckDirective::CheckNot(pattern) => forbidden.push(pattern.as_str()),

                CheckDirective::Check(pattern) | CheckDirective::CheckLabel(pattern) => {
                    let found = output_lines
                        .iter()
                        .skip(line_idx)
                        .position(|line| line.contains(pattern.as_str()));

                    match found {
                        Some(idx) => {
                            let skipped = &output_lines[line_idx..line_idx + idx];
                            Self::check_forbidden(skipped, &forbidden)?;
                            forbidden.clear();
                            line_idx += idx + 1;
                            if self.verbose {
                                println!("CHECK: '{}' found at line {}", pattern, line_idx - 1);
                            }
                        }
                        None => {
                            return Err(format!(
                                "CHECK: pattern '{}' not found in output:\n{}",
                                pattern, output
                            ));
                        }
                    }
                }

                CheckDirective::CheckNext(pattern) => {
                    if line_idx >= output_lines.len() {
                        return Err(format!("CHECK-NEXT: no more lines, expected '{}'", pattern));
                    }

                    let line = output_lines[line_idx];
                    if !line.contains(pattern.as_str()) {
                        return Err(format!(
                            "CHECK-NEXT: expected '{}' but got '{}'",
                            pattern, line
                        ));
                    }
                    line_idx += 1;
                }

                CheckDirective::CheckSame(pattern) => {
                    let line = line_idx
                        .checked_sub(1)
                        .and_then(|idx| output_lines.get(idx))
                        .ok_or_else(|| format!("CHECK-SAME: no previous match for '{}'", pattern))?;
                    if !line.contains(pattern.as_str()) {
                        return Err(format!(
                            "CHECK-SAME: expected '{}' on '{}'",
                            pattern, line
                        ));
                    }
                }

                CheckDirective::CheckEmpty => {
                    if line_idx >= output_lines.len() {
                        continue; // End of output counts as empty
                    }

                    let line = output_lines[line_idx];
                    if !line.trim().is_empty() {
                        return Err(format!(
                            "CHECK-EMPTY: expected empty line but got '{}'",
                            line
                        ));
                    }
                    line_idx += 1;
                }
            }
        }

        let rest = output_lines.get(line_idx..).unwrap_or(&[]);
        Self::check_forbidden(rest, &forbidden)
    }

    fn check_forbidden(lines: &[&str], forbidden: &[&str]) -> Result<(), String> {
        for pattern in forbidden {
            if let Some(line) = lines.iter().find(|line| line.contains(pattern)) {
                return Err(format!("CHECK-NOT: '{}' found in '{}'", pattern, line));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directives() {
        let content = "; RUN: irjit %s --interpret\n\
                       ; CHECK: exit\n\
                       ; CHECK-NEXT: r1 = 0x00000005\n\
                       ; COM: This is a comment\n\
                       SetConst r1, 5\n\
                       ExitToConst 0x100\n";

        let spec = TestSpec::parse(content).unwrap();
        assert_eq!(
            spec.run_directives,
            vec![RunDirective {
                command: "irjit".to_string(),
                args: vec!["--interpret".to_string()],
            }]
        );
        assert_eq!(spec.check_directives.len(), 3);
        assert!(spec.ir_content.contains("SetConst r1, 5"));
        assert!(TestSpec::parse("SetConst r1, 5\n").is_err());
    }

    #[test]
    fn test_check_matching() {
        let runner = TestRunner::new(false);
        let output =
            "block 0x00000000: 2 -> 2 instructions\n  SetConst r1, 0x5\n  ExitToConst 0x100\n";

        let directives = vec![
            CheckDirective::CheckLabel("block 0x00000000".to_string()),
            CheckDirective::CheckNot("Add".to_string()),
            CheckDirective::Check("SetConst".to_string()),
            CheckDirective::CheckSame("r1".to_string()),
            CheckDirective::CheckNext("ExitToConst".to_string()),
            CheckDirective::CheckEmpty,
        ];

        runner.validate_output(output, &directives).unwrap();
    }

    #[test]
    fn test_check_failures() {
        let runner = TestRunner::new(false);
        let output = "Line 1\nLine 2\nLine 3\n";

        let result = runner.validate_output(
            output,
            &[
                CheckDirective::Check("Line 1".to_string()),
                CheckDirective::CheckNext("Line 3".to_string()),
            ],
        );
        assert!(result.unwrap_err().contains("CHECK-NEXT"));

        let result = runner.validate_output(
            output,
            &[
                CheckDirective::CheckNot("Line 2".to_string()),
                CheckDirective::Check("Line 3".to_string()),
            ],
        );
        assert!(result.unwrap_err().contains("CHECK-NOT"));
    }

    #[test]
    fn test_run_interpreted_file() {
        let content = "; RUN: irjit %s --interpret\n\
                       ; CHECK: exit 0x00000000 -> 0x00000100\n\
                       ; CHECK-NEXT: r1 = 0x00000005\n\
                       SetConst r1, 5\n\
                       ExitToConst 0x100\n";
        let spec = TestSpec::parse(content).unwrap();
        TestRunner::new(false).run_test(&spec).unwrap();
    }
}

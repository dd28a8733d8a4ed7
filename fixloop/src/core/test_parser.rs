//! Parsing of test-framework output into normalized counts.
//!
//! Each parser recognizes the summary block its framework prints. Output that
//! no parser recognizes yields zero counts with `parse_failed` set rather than
//! an error.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{ExecutionResult, FailingTest, TestFramework, TestOutcome, pass_rate};

/// Counts extracted from test output before they are joined with execution data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub failing: Vec<FailingTest>,
}

impl TestCounts {
    fn sum(&self) -> u32 {
        self.passed
            .saturating_add(self.failed)
            .saturating_add(self.skipped)
    }
}

static PYTEST_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^=*\s*(?:\d+ (?:passed|failed|skipped|errors?|xfailed|xpassed|deselected|warnings?)(?:, )?)+.*\bin [\d.]+s").unwrap()
});
static PYTEST_NO_TESTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^=*\s*no tests ran\b").unwrap());
static PYTEST_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) (passed|failed|skipped|errors?|xfailed|xpassed)\b").unwrap()
});
static PYTEST_FAILED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:FAILED|ERROR) (\S+)(?: - (.+))?$").unwrap());

static JEST_TESTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Tests:\s+(.+)$").unwrap());
static JEST_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) (failed|skipped|passed|todo|total)\b").unwrap());
static JEST_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*● (.+)$").unwrap());

static MOCHA_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+) (passing|failing|pending)\b").unwrap());
const MOCHA_TITLE_LINES: usize = 8;
static MOCHA_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\) (.+?):?\s*$").unwrap());

static VITEST_TESTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*Tests\s+(.+?)\s*\((\d+)\)\s*$").unwrap());
static VITEST_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) (failed|passed|skipped|todo)\b").unwrap());
static VITEST_FAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*FAIL\s+(.+? > .+?)(?:\s+\[.*\])?\s*$").unwrap());

static UNITTEST_RAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Ran (\d+) tests? in").unwrap());
static UNITTEST_RESULT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(OK|FAILED)\b(?:\s*\((.*)\))?").unwrap());
static UNITTEST_DETAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(failures|errors|skipped|expected failures)=(\d+)").unwrap());
static UNITTEST_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:FAIL|ERROR): (\S+) \(([^)]+)\)").unwrap());

static EXCEPTION_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[\w.]+(?:Error|Exception)\b|expect\().*").unwrap());

/// Parse output for `framework`. `None` tries every parser in a fixed order.
pub fn parse(framework: TestFramework, output: &str) -> Option<TestCounts> {
    match framework {
        TestFramework::Pytest => parse_pytest(output),
        TestFramework::Jest => parse_jest(output),
        TestFramework::Mocha => parse_mocha(output),
        TestFramework::Vitest => parse_vitest(output),
        TestFramework::Django => parse_unittest(output),
        TestFramework::None => parse_pytest(output)
            .or_else(|| parse_jest(output))
            .or_else(|| parse_vitest(output))
            .or_else(|| parse_mocha(output))
            .or_else(|| parse_unittest(output)),
    }
}

/// Join parsed counts with the execution that produced them.
pub fn build_outcome(framework: TestFramework, execution: &ExecutionResult) -> TestOutcome {
    let output = execution.combined_output();
    let parsed = parse(framework, &output);
    let parse_failed = parsed.is_none();
    let counts = parsed.unwrap_or_default();
    TestOutcome {
        framework,
        command: execution.command.clone(),
        total: counts.total,
        passed: counts.passed,
        failed: counts.failed,
        skipped: counts.skipped,
        pass_rate: pass_rate(counts.passed, counts.total, counts.skipped),
        failing: counts.failing,
        duration_ms: execution.duration_ms,
        exit_code: execution.exit_code,
        timed_out: execution.timed_out,
        parse_failed,
        output,
    }
}

pub fn parse_pytest(output: &str) -> Option<TestCounts> {
    let lines: Vec<&str> = output.lines().collect();
    let summary = lines
        .iter()
        .rev()
        .find(|l| PYTEST_SUMMARY_RE.is_match(l.trim()) || PYTEST_NO_TESTS_RE.is_match(l.trim()))?;

    let mut counts = TestCounts::default();
    for caps in PYTEST_COUNT_RE.captures_iter(summary) {
        let n: u32 = caps[1].parse().unwrap_or(0);
        match &caps[2] {
            "passed" | "xpassed" => counts.passed = counts.passed.saturating_add(n),
            "failed" | "error" | "errors" => counts.failed = counts.failed.saturating_add(n),
            "skipped" | "xfailed" => counts.skipped = counts.skipped.saturating_add(n),
            _ => {}
        }
    }
    counts.total = counts.sum();
    counts.failing = lines
        .iter()
        .filter_map(|l| PYTEST_FAILED_RE.captures(l.trim_end()))
        .map(|caps| FailingTest {
            id: caps[1].to_string(),
            message: caps.get(2).map(|m| m.as_str().to_string()),
        })
        .collect();
    Some(counts)
}

pub fn parse_jest(output: &str) -> Option<TestCounts> {
    let lines: Vec<&str> = output.lines().collect();
    let summary = lines
        .iter()
        .rev()
        .find_map(|l| JEST_TESTS_RE.captures(l.trim()))?;

    let mut counts = TestCounts::default();
    for caps in JEST_COUNT_RE.captures_iter(&summary[1]) {
        let n: u32 = caps[1].parse().unwrap_or(0);
        match &caps[2] {
            "failed" => counts.failed = n,
            "passed" => counts.passed = n,
            "skipped" | "todo" => counts.skipped = counts.skipped.saturating_add(n),
            "total" => counts.total = n,
            _ => {}
        }
    }
    if counts.total == 0 {
        counts.total = counts.sum();
    }
    counts.failing = headers_with_messages(&lines, &JEST_HEADER_RE, |line| {
        line.trim_start().starts_with('●')
    });
    Some(counts)
}

pub fn parse_mocha(output: &str) -> Option<TestCounts> {
    let lines: Vec<&str> = output.lines().collect();
    let mut counts = TestCounts::default();
    let mut recognized = false;
    let mut failing_from = None;
    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = MOCHA_COUNT_RE.captures(line) {
            recognized = true;
            let n: u32 = caps[1].parse().unwrap_or(0);
            match &caps[2] {
                "passing" => counts.passed = n,
                "failing" => {
                    counts.failed = n;
                    failing_from = Some(idx + 1);
                }
                "pending" => counts.skipped = n,
                _ => {}
            }
        }
    }
    if !recognized {
        return None;
    }
    counts.total = counts.sum();
    if let Some(from) = failing_from {
        counts.failing = mocha_failures(&lines[from..]);
    }
    Some(counts)
}

pub fn parse_vitest(output: &str) -> Option<TestCounts> {
    let lines: Vec<&str> = output.lines().collect();
    let caps = lines.iter().rev().find_map(|l| VITEST_TESTS_RE.captures(l))?;

    let mut counts = TestCounts {
        total: caps[2].parse().unwrap_or(0),
        ..TestCounts::default()
    };
    for count in VITEST_COUNT_RE.captures_iter(&caps[1]) {
        let n: u32 = count[1].parse().unwrap_or(0);
        match &count[2] {
            "failed" => counts.failed = n,
            "passed" => counts.passed = n,
            "skipped" | "todo" => counts.skipped = counts.skipped.saturating_add(n),
            _ => {}
        }
    }
    counts.failing = headers_with_messages(&lines, &VITEST_FAIL_RE, |line| {
        VITEST_FAIL_RE.is_match(line)
    });
    Some(counts)
}

pub fn parse_unittest(output: &str) -> Option<TestCounts> {
    let lines: Vec<&str> = output.lines().collect();
    let ran_idx = lines
        .iter()
        .rposition(|l| UNITTEST_RAN_RE.is_match(l.trim()))?;
    let total: u32 = UNITTEST_RAN_RE
        .captures(lines[ran_idx].trim())
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0);

    let mut counts = TestCounts {
        total,
        ..TestCounts::default()
    };
    if let Some(caps) = lines[ran_idx + 1..]
        .iter()
        .find_map(|l| UNITTEST_RESULT_RE.captures(l.trim()))
        && let Some(details) = caps.get(2)
    {
        for detail in UNITTEST_DETAIL_RE.captures_iter(details.as_str()) {
            let n: u32 = detail[2].parse().unwrap_or(0);
            match &detail[1] {
                "failures" | "errors" => counts.failed = counts.failed.saturating_add(n),
                "skipped" | "expected failures" => counts.skipped = counts.skipped.saturating_add(n),
                _ => {}
            }
        }
    }
    counts.passed = total.saturating_sub(counts.failed.saturating_add(counts.skipped));
    counts.failing = lines
        .iter()
        .enumerate()
        .filter_map(|(idx, line)| {
            let caps = UNITTEST_HEADER_RE.captures(line)?;
            Some(FailingTest {
                id: format!("{} ({})", &caps[1], &caps[2]),
                message: first_exception_after(&lines, idx + 1, |l| {
                    UNITTEST_HEADER_RE.is_match(l) || l.starts_with("Ran ")
                }),
            })
        })
        .collect();
    Some(counts)
}

/// Mocha prints a failure's full title after `N) `, one suite per line, the
/// last line ending with `:`. The id joins those parts with spaces.
fn mocha_failures(lines: &[&str]) -> Vec<FailingTest> {
    let mut failing: Vec<FailingTest> = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let Some(caps) = MOCHA_HEADER_RE.captures(line) else {
            continue;
        };
        let mut parts = vec![caps[1].trim().to_string()];
        let mut body = idx + 1;
        if !line.trim_end().ends_with(':') {
            let rest = &lines[body..];
            if let Some(end) = rest.iter().take(MOCHA_TITLE_LINES).position(|l| {
                let t = l.trim();
                t.is_empty() || t.ends_with(':') || EXCEPTION_LINE_RE.is_match(l)
            }) && rest[end].trim().ends_with(':')
                && !EXCEPTION_LINE_RE.is_match(rest[end])
            {
                parts.extend(
                    rest[..=end]
                        .iter()
                        .map(|l| l.trim().trim_end_matches(':').to_string()),
                );
                body += end + 1;
            }
        }
        let id = parts.join(" ");
        if failing.iter().any(|f| f.id == id) {
            continue;
        }
        let message = first_exception_after(lines, body, |l| MOCHA_HEADER_RE.is_match(l));
        failing.push(FailingTest { id, message });
    }
    failing
}

/// Collect failure headers matched by `header`, each with the first
/// exception-looking line before the next header.
fn headers_with_messages(
    lines: &[&str],
    header: &Regex,
    is_boundary: impl Fn(&str) -> bool,
) -> Vec<FailingTest> {
    let mut failing: Vec<FailingTest> = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let Some(caps) = header.captures(line) else {
            continue;
        };
        let id = caps[1].trim().to_string();
        if failing.iter().any(|f| f.id == id) {
            continue;
        }
        let message = first_exception_after(lines, idx + 1, &is_boundary);
        failing.push(FailingTest { id, message });
    }
    failing
}

fn first_exception_after(
    lines: &[&str],
    from: usize,
    is_boundary: impl Fn(&str) -> bool,
) -> Option<String> {
    lines[from.min(lines.len())..]
        .iter()
        .take_while(|&&l| !is_boundary(l))
        .find(|l| EXCEPTION_LINE_RE.is_match(l))
        .map(|l| l.trim().to_string())
}

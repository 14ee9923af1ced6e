//! JSON and JUnit report writers for `--json-output` / `--junit-output`.

use std::path::Path;

use anyhow::{Context, Result};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::writer::Writer;

use core_engine::model::{ExecutionRecord, GateResult};

pub fn write_json_report(path: &Path, record: &ExecutionRecord, gates: &[GateResult]) -> Result<()> {
    let payload = serde_json::json!({
        "script_path": record.script_path,
        "exit_code": record.exit_code,
        "success": record.success,
        "timed_out": record.timed_out,
        "cancelled": record.cancelled,
        "attempt_number": record.attempt_number,
        "duration_seconds": record.duration_seconds,
        "metrics": record.metrics,
        "error": record.error,
        "gates": gates,
    });
    let contents = serde_json::to_string_pretty(&payload).context("serializing JSON report")?;
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
}

/// Emits a single-testcase JUnit document: the whole run is one test, its
/// failure (if any) carries the error summary and any failed gates.
pub fn write_junit_report(path: &Path, record: &ExecutionRecord, gates: &[GateResult]) -> Result<()> {
    let mut writer = Writer::new(Vec::new());

    let mut suite = BytesStart::new("testsuite");
    suite.push_attribute(("name", record.script_path.as_str()));
    suite.push_attribute(("tests", "1"));
    let failed = !record.success || gates.iter().any(|g| !g.passed);
    suite.push_attribute(("failures", if failed { "1" } else { "0" }));
    suite.push_attribute(("time", record.duration_seconds.to_string().as_str()));
    writer.write_event(Event::Start(suite))?;

    let mut case = BytesStart::new("testcase");
    case.push_attribute(("name", record.script_path.as_str()));
    case.push_attribute(("time", record.duration_seconds.to_string().as_str()));

    if failed {
        writer.write_event(Event::Start(case))?;
        let mut failure = BytesStart::new("failure");
        let message = record
            .error
            .clone()
            .unwrap_or_else(|| format!("exit_code={}", record.exit_code));
        failure.push_attribute(("message", message.as_str()));
        writer.write_event(Event::Start(failure))?;

        let mut detail = String::new();
        for gate in gates.iter().filter(|g| !g.passed) {
            detail.push_str(&format!(
                "gate failed: {} observed={} bound={}\n",
                gate.metric_name, gate.observed, gate.bound
            ));
        }
        writer.write_event(Event::Text(BytesText::new(&detail)))?;
        writer.write_event(Event::End(BytesEnd::new("failure")))?;
        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    } else {
        writer.write_event(Event::Empty(case))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;

    let xml = writer.into_inner();
    std::fs::write(path, xml).with_context(|| format!("writing {}", path.display()))
}

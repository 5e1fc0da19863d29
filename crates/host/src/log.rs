// crates/host/src/log.rs

//! Colored terminal rendering for instruction reports.

use std::fmt::Display;

use nl_orchestrator_core::error::ErrorReport;
use nl_orchestrator_core::{InstructionReport, InvocationOutcome, Outcome, StepReport, StepStatus};

// ANSI color codes
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const MAGENTA: &str = "\x1b[35m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";

/// Component a line is attributed to.
#[derive(Clone, Copy)]
pub enum Stage {
    Safety,
    Classifier,
    Planner,
    Synthesizer,
}

impl Stage {
    fn color(&self) -> &'static str {
        match self {
            Stage::Safety => YELLOW,
            Stage::Classifier => CYAN,
            Stage::Planner => BLUE,
            Stage::Synthesizer => MAGENTA,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Stage::Safety => "Safety",
            Stage::Classifier => "Classifier",
            Stage::Planner => "Planner",
            Stage::Synthesizer => "Synthesizer",
        }
    }

    fn tag(&self) -> String {
        format!("{}{BOLD}[{}]{RESET}", self.color(), self.name())
    }
}

/// Print a finished instruction to stdout.
pub fn report(report: &InstructionReport) {
    match &report.outcome {
        Outcome::Refused => {
            let category = report
                .safety
                .category
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unspecified".to_string());
            println!(
                "{} {RED}✗ Refused{RESET} ({}): {}",
                Stage::Safety.tag(),
                category,
                report.safety.reason
            );
        }
        Outcome::Answered { text } => {
            println!("{} {WHITE}←{RESET} {}", Stage::Classifier.tag(), text);
        }
        Outcome::Executed { steps, synthesized } => {
            for key in synthesized {
                println!("{} {GREEN}+ {}{RESET}", Stage::Synthesizer.tag(), key);
            }
            for step in steps {
                step_report(step);
            }
            let failed = steps
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .count();
            if failed == 0 {
                println!("{GREEN}✓ Done:{RESET} {} step(s)", steps.len());
            } else {
                println!(
                    "{YELLOW}Done with failures:{RESET} {}/{} step(s) failed",
                    failed,
                    steps.len()
                );
            }
        }
    }

    for warning in &report.warnings {
        warn(warning);
    }
}

/// Steps that ran before an instruction aborted.
pub fn steps(steps: &[StepReport]) {
    for step in steps {
        step_report(step);
    }
}

fn step_report(step: &StepReport) {
    let (symbol, color) = match step.status {
        StepStatus::Succeeded | StepStatus::Computed => ("✓", GREEN),
        StepStatus::PartiallyFailed => ("~", YELLOW),
        StepStatus::Failed => ("✗", RED),
    };
    println!(
        "{} {color}{symbol}{RESET} {BOLD}Step {}{RESET} {DIM}{}{RESET}",
        Stage::Planner.tag(),
        step.number,
        truncate(&step.description, 100)
    );

    if let Some(result) = &step.result {
        println!("    {CYAN}=>{RESET} {}", result);
        return;
    }
    for outcome in &step.outcomes {
        invocation(outcome);
    }
}

fn invocation(outcome: &InvocationOutcome) {
    println!("    {CYAN}→ {}{RESET}", truncate(&outcome.command, 120));
    match &outcome.result {
        Ok(output) => {
            for line in output.lines() {
                println!("      {}", line);
            }
        }
        Err(report) => println!("      {RED}✗{RESET} {}", report),
    }
}

/// Startup summary.
pub fn banner(capabilities: usize, categories: &[String]) {
    println!("{BOLD}Natural-Language Orchestrator{RESET}");
    println!(
        "{DIM}{} capabilities in {} categories: {}{RESET}",
        capabilities,
        categories.len(),
        categories.join(", ")
    );
    println!("Type an instruction and press Enter. Type 'quit' to exit.\n");
}

/// Log an instruction-level error.
pub fn error(report: &ErrorReport) {
    eprintln!("{RED}{BOLD}✗ Error:{RESET} {}", report);
}

/// Log info message.
pub fn info(message: impl Display) {
    eprintln!("{DIM}[info]{RESET} {}", message);
}

/// Log a warning.
pub fn warn(message: impl Display) {
    eprintln!("{YELLOW}[warn]{RESET} {}", message);
}

/// Truncate and clean string for display.
pub fn truncate(s: &str, max: usize) -> String {
    let clean: String = s
        .chars()
        .filter(|c| !c.is_control() || *c == ' ')
        .collect();
    let trimmed = clean.trim();
    match trimmed.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_strips_control_characters() {
        assert_eq!(truncate("  a\tb\nc  ", 10), "abc");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 4), "héll...");
        assert_eq!(truncate("short", 10), "short");
    }
}

// crates/core/tests/end_to_end.rs

//! Whole-instruction flows against scripted backends and an in-process
//! sandbox.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use serde_json::{json, Value};

use nl_orchestrator_core::ai_client::{AiClient, ChatRequest, ChatResponse, ScriptedClient};
use nl_orchestrator_core::error::ErrorKind;
use nl_orchestrator_core::memory::StepWarning;
use nl_orchestrator_core::safety::Confidence;
use nl_orchestrator_core::synthesizer::CapabilitySandbox;
use nl_orchestrator_core::{
    handler_fn, CapabilityDescriptor, CapabilityHandler, CapabilityRegistry, Orchestrator,
    OrchestratorConfig, OrchestratorError, Outcome, ParamType, ParameterSpec, StepStatus,
};

const SAFE: &str = r#"{"is_safe": true, "category": null, "reason": "everyday request", "confidence": "high"}"#;

const GOOD_SOURCE: &str = "pub fn run(args: &serde_json::Value) -> Result<String, String> {\n    let text = capability_common::arg_str(args, \"text\")?;\n    Ok(text.chars().rev().collect())\n}\n";

/// Replies for each component sharing the classification backend.
struct Script {
    safety: String,
    classifier: String,
    planner: VecDeque<String>,
    /// Delay before answering, per component name.
    delays: Vec<(&'static str, Duration)>,
}

impl Script {
    fn plan(steps: &[&str], categories: &[&str]) -> Self {
        Self {
            safety: SAFE.to_string(),
            classifier: json!({"type": "plan", "steps": steps, "categories": categories}).to_string(),
            planner: VecDeque::new(),
            delays: Vec::new(),
        }
    }

    fn answer(text: &str) -> Self {
        Self {
            classifier: json!({"type": "answer", "answer": text}).to_string(),
            ..Self::plan(&[], &[])
        }
    }

    fn then(mut self, action: Value) -> Self {
        self.planner.push_back(action.to_string());
        self
    }

    fn slow(mut self, component: &'static str, delay: Duration) -> Self {
        self.delays.push((component, delay));
        self
    }

    fn into_client(self) -> Arc<ScriptedClient> {
        let delays = self.delays.clone();
        let safety = self.safety.clone();
        let classifier = self.classifier.clone();
        let planner = Mutex::new(self.planner);

        Arc::new(ScriptedClient::new(move |request: &ChatRequest| {
            let component = component_of(request);
            if let Some((_, delay)) = delays.iter().find(|(c, _)| *c == component) {
                std::thread::sleep(*delay);
            }
            let text = match component {
                "safety" => safety.clone(),
                "classifier" => classifier.clone(),
                "planner" => planner
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| json!({"action": "complete"}).to_string()),
                "elaboration" => "Reverse the characters of the `text` parameter.".to_string(),
                other => bail!("unexpected prompt for {}", other),
            };
            Ok(ChatResponse::from_text(text))
        }))
    }
}

fn component_of(request: &ChatRequest) -> &'static str {
    let system = request
        .messages
        .first()
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if system.contains("**Safety Classifier**") {
        "safety"
    } else if system.contains("**Classifier**") {
        "classifier"
    } else if system.contains("**Execution Planner**") {
        "planner"
    } else if system.contains("**Capability Designer**") {
        "elaboration"
    } else {
        "unknown"
    }
}

fn planner_requests(client: &ScriptedClient) -> Vec<String> {
    client
        .requests()
        .iter()
        .filter(|r| component_of(r) == "planner")
        .map(ChatRequest::transcript)
        .collect()
}

/// Sandbox that accepts every artifact and loads a string reverser.
struct StubSandbox;

impl CapabilitySandbox for StubSandbox {
    fn check_syntax(&self, _source: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn dry_run(&self, _crate_dir: &Path, _package: &str) -> anyhow::Result<String> {
        Ok("test result: ok. 1 passed".to_string())
    }

    fn load(&self, _crate_dir: &Path, _package: &str) -> anyhow::Result<Arc<dyn CapabilityHandler>> {
        Ok(handler_fn(|_, args| {
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok(text.chars().rev().collect())
        }))
    }
}

/// Mail capabilities that record every opened message id.
fn mail_registry(opened: Arc<Mutex<Vec<String>>>) -> Arc<CapabilityRegistry> {
    let list = CapabilityDescriptor::new(
        "mail",
        "list",
        "List recent messages",
        handler_fn(|_, args| {
            let count = args.get("count").and_then(Value::as_i64).unwrap_or(3);
            let ids: Vec<String> = (1..=count).map(|i| format!("a{}", i)).collect();
            Ok(format!("Found {} messages. IDs: {}", ids.len(), ids.join(", ")))
        }),
    )
    .with_parameter(
        ParameterSpec::new("count", ParamType::Integer)
            .with_default(3)
            .with_alias("last"),
    );

    let view = CapabilityDescriptor::new(
        "mail",
        "view",
        "Show one message",
        handler_fn(move |_, args| {
            let id = args.get("id").and_then(Value::as_str).unwrap_or_default();
            if id == "bad" {
                bail!("message 'bad' does not exist");
            }
            opened.lock().unwrap().push(id.to_string());
            Ok(format!("Message {}: hello", id))
        }),
    )
    .with_parameter(ParameterSpec::new("id", ParamType::String).required());

    Arc::new(CapabilityRegistry::from_descriptors([list, view]).unwrap())
}

struct Harness {
    orchestrator: Orchestrator,
    registry: Arc<CapabilityRegistry>,
    classifier: Arc<ScriptedClient>,
    codegen: Arc<ScriptedClient>,
    opened: Arc<Mutex<Vec<String>>>,
    _root: tempfile::TempDir,
}

fn harness(script: Script, codegen_replies: Vec<String>, tune: impl FnOnce(&mut OrchestratorConfig)) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let mut config = OrchestratorConfig::default();
    config.capabilities_root = root.path().to_path_buf();
    tune(&mut config);

    let opened = Arc::new(Mutex::new(Vec::new()));
    let registry = mail_registry(Arc::clone(&opened));
    let classifier = script.into_client();
    let codegen = Arc::new(ScriptedClient::replies(if codegen_replies.is_empty() {
        vec![String::new()]
    } else {
        codegen_replies
    }));

    let orchestrator = Orchestrator::new(
        &config,
        Arc::clone(&registry),
        Arc::clone(&classifier) as Arc<dyn AiClient>,
        Arc::clone(&codegen) as Arc<dyn AiClient>,
        Arc::new(StubSandbox),
    );

    Harness {
        orchestrator,
        registry,
        classifier,
        codegen,
        opened,
        _root: root,
    }
}

fn artifact(source: &str) -> String {
    json!({
        "summary": "Reverse a string",
        "parameters": [{"name": "text", "type": "string", "required": true}],
        "source": source,
        "self_test": "use cap_text__reverse::run;\n#[test]\nfn reverses() { assert_eq!(run(&serde_json::json!({\"text\": \"ab\"})).unwrap(), \"ba\"); }\n"
    })
    .to_string()
}

fn execute(command: &str) -> Value {
    json!({"action": "execute", "command": command})
}

#[test]
fn list_then_view_opens_each_message_in_order() {
    let script = Script::plan(&["List my last 3 messages", "Open each of them"], &["mail"])
        .then(execute("mail:list last 3"))
        .then(execute("mail:view id:a1 && mail:view id:a2 && mail:view id:a3"));
    let h = harness(script, vec![], |_| {});

    let report = h.orchestrator.run("open my last 3 messages").unwrap();

    assert_eq!(*h.opened.lock().unwrap(), vec!["a1", "a2", "a3"]);
    assert!(report.warnings.is_empty());
    match report.outcome {
        Outcome::Executed { steps, synthesized } => {
            assert!(synthesized.is_empty());
            assert_eq!(steps.len(), 2);
            assert_eq!(steps[1].status, StepStatus::Succeeded);
            assert_eq!(steps[1].outcomes.len(), 3);
            assert_eq!(
                steps[1].outcomes[2].result.as_deref().unwrap(),
                "Message a3: hello"
            );
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let prompts = planner_requests(&h.classifier);
    assert_eq!(prompts.len(), 2);
    // Step 1 output is visible to the planner of step 2.
    assert!(prompts[1].contains("- mail:last_ids: a1, a2, a3"));
    assert!(prompts[1].contains("Found 3 messages. IDs: a1, a2, a3"));
    assert!(prompts[0].contains("## CONTEXT\n(empty)"));
}

#[test]
fn consumed_identifiers_are_shown_and_reuse_is_flagged() {
    let script = Script::plan(&["List messages", "Open the first", "Open it again"], &["mail"])
        .then(execute("mail:list"))
        .then(execute("mail:view id:a1"))
        .then(execute("mail:view id:a1"));
    let h = harness(script, vec![], |_| {});

    let report = h.orchestrator.run("read a1 twice").unwrap();

    assert_eq!(report.warnings.len(), 1);
    match &report.warnings[0] {
        StepWarning::ReusedIdentifier { identifier, .. } => assert_eq!(identifier, "a1"),
    }
    let prompts = planner_requests(&h.classifier);
    assert!(prompts[2].contains("## CONSUMED (do not reuse)\na1"));
}

#[test]
fn failing_invocation_does_not_stop_the_chain() {
    let script = Script::plan(&["Open three messages"], &["mail"])
        .then(execute("mail:view id:a1 && mail:view id:bad && mail:view id:a2"));
    let h = harness(script, vec![], |_| {});

    let report = h.orchestrator.run("open a1, bad and a2").unwrap();

    assert_eq!(*h.opened.lock().unwrap(), vec!["a1", "a2"]);
    match report.outcome {
        Outcome::Executed { steps, .. } => {
            assert_eq!(steps[0].status, StepStatus::PartiallyFailed);
            let failure = steps[0].outcomes[1].result.as_ref().unwrap_err();
            assert_eq!(failure.kind, ErrorKind::CapabilityError);
            assert!(failure.message.contains("does not exist"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn missing_capability_is_synthesized_then_used() {
    let script = Script::plan(&["Reverse the word abc"], &["mail"])
        .then(json!({
            "action": "synthesize",
            "namespace": "text",
            "name": "reverse",
            "description": "reverse a string",
            "example_usage": "text:reverse text:abc"
        }))
        .then(execute("text:reverse text:abc"));
    let h = harness(script, vec![artifact(GOOD_SOURCE)], |_| {});

    let report = h.orchestrator.run("reverse abc").unwrap();

    match report.outcome {
        Outcome::Executed { steps, synthesized } => {
            assert_eq!(synthesized, vec!["text:reverse"]);
            assert_eq!(steps.len(), 1);
            assert_eq!(steps[0].outcomes[0].result.as_deref().unwrap(), "cba");
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    assert!(h.registry.list_categories().contains(&"text".to_string()));
    let prompts = planner_requests(&h.classifier);
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("- text:reverse: Reverse a string"));
    assert!(prompts[1].contains("- text:reverse: Reverse a string"));
    assert_eq!(h.codegen.call_count(), 1);
    assert_eq!(
        h.orchestrator.synthesizer().store().load_all().unwrap().len(),
        1
    );
}

#[test]
fn exhausted_quota_aborts_without_calling_codegen_again() {
    let synthesize = json!({
        "action": "synthesize",
        "namespace": "text",
        "name": "reverse",
        "description": "reverse a string"
    });
    let script = Script::plan(&["Reverse abc"], &[])
        .then(synthesize.clone())
        .then(synthesize);
    let h = harness(script, vec![artifact("fn no_entry_point() {}")], |c| {
        c.synthesis_max_attempts = 1;
    });

    let err = h.orchestrator.run("reverse abc").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SynthesisExhausted);
    assert_eq!(h.codegen.call_count(), 1);

    let err = h.orchestrator.run("reverse abc").unwrap_err();
    match err {
        OrchestratorError::SynthesisExhausted { key, attempts, .. } => {
            assert_eq!(key, "text:reverse");
            assert_eq!(attempts.len(), 1);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(h.codegen.call_count(), 1);
    assert!(!h.registry.contains("text", "reverse"));
}

#[test]
fn exhausted_synthesis_keeps_the_steps_already_run() {
    let script = Script::plan(&["List my messages", "Reverse the subjects"], &["mail"])
        .then(execute("mail:list last 2"))
        .then(json!({
            "action": "synthesize",
            "namespace": "text",
            "name": "reverse",
            "description": "reverse a string"
        }));
    let h = harness(script, vec![artifact("fn no_entry_point() {}")], |c| {
        c.synthesis_max_attempts = 1;
    });

    let err = h.orchestrator.run("reverse my message subjects").unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SynthesisExhausted);
    let completed = err.completed_steps();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].command, "mail:list last 2");
    assert_eq!(completed[0].status, StepStatus::Succeeded);
    assert_eq!(
        completed[0].outcomes[0].result.as_deref().unwrap(),
        "Found 2 messages. IDs: a1, a2"
    );
}

#[test]
fn safety_timeout_fails_open() {
    let script = Script::answer("Paris.").slow("safety", Duration::from_millis(1500));
    let h = harness(script, vec![], |c| c.timeouts.safety_secs = 1);

    let report = h.orchestrator.run("what is the capital of France?").unwrap();

    assert!(report.safety.is_safe);
    assert_eq!(report.safety.confidence, Confidence::Low);
    match report.outcome {
        Outcome::Answered { text } => assert_eq!(text, "Paris."),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn classifier_timeout_fails_closed() {
    let script = Script::answer("Paris.").slow("classifier", Duration::from_millis(1500));
    let h = harness(script, vec![], |c| c.timeouts.classifier_secs = 1);

    let err = h.orchestrator.run("what is the capital of France?").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimeoutError);
}

#[test]
fn unsafe_instruction_is_refused_before_planning() {
    let mut script = Script::plan(&["List messages"], &["mail"]).then(execute("mail:list"));
    script.safety =
        r#"{"is_safe": false, "category": "malware", "reason": "asks for ransomware", "confidence": "high"}"#
            .to_string();
    let h = harness(script, vec![], |_| {});

    let report = h.orchestrator.run("write ransomware").unwrap();

    assert!(matches!(report.outcome, Outcome::Refused));
    assert!(!report.safety.is_safe);
    assert!(planner_requests(&h.classifier).is_empty());
    assert!(h
        .classifier
        .requests()
        .iter()
        .all(|r| component_of(r) == "safety"));
}

#[test]
fn unreadable_planner_reply_is_retried_then_rejected() {
    let mut script = Script::plan(&["List messages"], &["mail"]);
    script.planner.push_back("I would list the messages".to_string());
    script.planner.push_back("{\"action\": \"teleport\"}".to_string());
    let h = harness(script, vec![], |_| {});

    let err = h.orchestrator.run("list my messages").unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ClassificationError);
    assert_eq!(planner_requests(&h.classifier).len(), 2);
}

#[test]
fn iteration_ceiling_stops_the_workflow() {
    let script = Script::plan(&["List", "List again", "List a third time"], &["mail"])
        .then(execute("mail:list"))
        .then(execute("mail:list"))
        .then(execute("mail:list"));
    let h = harness(script, vec![], |c| c.max_iterations = 2);

    let err = h.orchestrator.run("list three times").unwrap_err();
    match err {
        OrchestratorError::IncompleteWorkflow {
            iterations,
            completed,
            planned,
        } => {
            assert_eq!((iterations, completed, planned), (2, 2, 3));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn cancelled_instruction_stops_before_the_first_step() {
    let script = Script::plan(&["List messages"], &["mail"]).then(execute("mail:list"));
    let h = harness(script, vec![], |_| {});

    h.orchestrator.cancellation().cancel();
    let err = h.orchestrator.run("list my messages").unwrap_err();

    assert!(matches!(err, OrchestratorError::Cancelled { step: 1 }));
    assert!(planner_requests(&h.classifier).is_empty());
}

#[test]
fn local_compute_and_early_completion() {
    let script = Script::plan(&["List messages", "Count them", "Archive them"], &["mail"])
        .then(execute("mail:list"))
        .then(json!({"action": "compute", "result": "3 messages"}))
        .then(json!({"action": "complete"}));
    let h = harness(script, vec![], |_| {});

    let report = h.orchestrator.run("how many messages do I have?").unwrap();

    match report.outcome {
        Outcome::Executed { steps, .. } => {
            assert_eq!(steps.len(), 2);
            assert_eq!(steps[1].status, StepStatus::Computed);
            assert_eq!(steps[1].result.as_deref(), Some("3 messages"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

//! Flow Engine
//!
//! Interprets a flow graph. The walk is driven by edge resolution: every
//! outgoing edge of an executed node is either taken or pruned, and a node
//! runs once all of its incoming edges are resolved and at least one was
//! taken. A node whose incoming edges were all pruned is pruned itself, so
//! an unchosen branch never runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::hooks::{HookEvent, HookRegistry};
use super::plugins::{ActionExecutor, ActionResult};
use crate::condition::ConditionEvaluator;
use crate::config::EngineConfig;
use crate::flow::{
    validate, ActionData, ActionKind, ConditionData, Edge, Flow, LogLevel, Node, NodeData, OutputData,
    OutputType, HANDLE_ERROR, HANDLE_FALSE, HANDLE_OUTPUT, HANDLE_TRUE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionErrorKind {
    Validation,
    Action,
    Timeout,
    Internal,
}

/// Outcome of one flow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub flow_id: String,
    pub status: ExecutionStatus,
    pub node_results: BTreeMap<String, Value>,
    /// Node ids in the order they ran
    pub executed_nodes: Vec<String>,
    /// Value recorded by the output node, or an object keyed by node id
    /// when several output nodes ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ExecutionErrorKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn ran(&self, node_id: &str) -> bool {
        self.executed_nodes.iter().any(|id| id == node_id)
    }

    /// The node ran and its result is not a `success: false` envelope
    pub fn succeeded(&self, node_id: &str) -> bool {
        self.ran(node_id)
            && self
                .node_results
                .get(node_id)
                .and_then(|v| v.get("success"))
                .and_then(Value::as_bool)
                != Some(false)
    }
}

/// Why a walk stopped early
struct Abort {
    kind: ExecutionErrorKind,
    message: String,
}

/// Which outgoing edges of an executed node are taken
enum Selection<'a> {
    All,
    Handle(&'a str),
}

/// Mutable state of one execution
struct Run<'f> {
    flow: &'f Flow,
    execution_id: String,
    input: Value,
    node_results: BTreeMap<String, Value>,
    executed: Vec<String>,
    outputs: Vec<(String, Value)>,
    taken: HashMap<&'f str, bool>,
    scheduled: HashSet<&'f str>,
}

impl<'f> Run<'f> {
    fn new(flow: &'f Flow, execution_id: String, input: Value) -> Self {
        Self {
            flow,
            execution_id,
            input,
            node_results: BTreeMap::new(),
            executed: Vec::new(),
            outputs: Vec::new(),
            taken: HashMap::new(),
            scheduled: HashSet::new(),
        }
    }

    /// Variables, then input fields, then node results in execution order.
    /// Object results are merged at top level and also kept under the node id.
    fn snapshot(&self) -> Value {
        let mut snapshot = Map::new();
        for variable in &self.flow.variables {
            if let Some(value) = &variable.default_value {
                snapshot.insert(variable.name.clone(), value.clone());
            }
        }
        if let Value::Object(fields) = &self.input {
            snapshot.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        for id in &self.executed {
            if let Some(result) = self.node_results.get(id) {
                if let Value::Object(fields) = result {
                    snapshot.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                snapshot.insert(id.clone(), result.clone());
            }
        }
        Value::Object(snapshot)
    }

    /// Values flowing into a node along taken edges
    fn incoming_value(&self, node_id: &str) -> Value {
        let mut sources: Vec<(&str, &Value)> = self
            .flow
            .incoming(node_id)
            .filter(|e| self.taken.get(e.id.as_str()) == Some(&true))
            .filter_map(|e| {
                self.node_results
                    .get(&e.source)
                    .map(|v| (e.source.as_str(), v))
            })
            .collect();
        match sources.len() {
            0 => Value::Null,
            1 => sources.remove(0).1.clone(),
            _ => Value::Object(
                sources
                    .into_iter()
                    .map(|(id, v)| (id.to_string(), v.clone()))
                    .collect(),
            ),
        }
    }

    fn final_output(&self) -> Option<Value> {
        match self.outputs.as_slice() {
            [] => None,
            [(_, value)] => Some(value.clone()),
            many => Some(Value::Object(
                many.iter().map(|(id, v)| (id.clone(), v.clone())).collect(),
            )),
        }
    }
}

pub struct FlowEngine {
    executor: Arc<dyn ActionExecutor>,
    hooks: Arc<HookRegistry>,
    evaluator: ConditionEvaluator,
    config: EngineConfig,
}

impl FlowEngine {
    pub fn new(executor: Arc<dyn ActionExecutor>, hooks: Arc<HookRegistry>, config: EngineConfig) -> Self {
        Self {
            executor,
            hooks,
            evaluator: ConditionEvaluator::with_details(),
            config,
        }
    }

    pub fn with_defaults(executor: Arc<dyn ActionExecutor>) -> Self {
        Self::new(executor, Arc::new(HookRegistry::default()), EngineConfig::default())
    }

    /// Execute a flow. Never fails: every problem is reported in the result.
    pub async fn execute(&self, flow: &Flow, input: Option<Value>) -> ExecutionResult {
        let execution_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();

        let report = validate(flow);
        if !report.valid {
            warn!(flow_id = %flow.id, errors = ?report.errors, "Refusing to execute invalid flow");
            let message = format!("Invalid flow: {}", report.errors.join("; "));
            self.hooks
                .emit(&HookEvent::FlowFailed {
                    flow_id: flow.id.clone(),
                    execution_id: execution_id.clone(),
                    error: message.clone(),
                })
                .await;
            return ExecutionResult {
                execution_id,
                flow_id: flow.id.clone(),
                status: ExecutionStatus::Failed,
                node_results: BTreeMap::new(),
                executed_nodes: Vec::new(),
                output: None,
                error: Some(message),
                error_kind: Some(ExecutionErrorKind::Validation),
                validation_errors: report.errors,
                started_at,
                finished_at: Utc::now(),
                duration_ms: clock.elapsed().as_millis() as u64,
            };
        }

        info!(flow_id = %flow.id, execution_id = %execution_id, "Flow execution started");
        self.hooks
            .emit(&HookEvent::FlowStarted {
                flow_id: flow.id.clone(),
                execution_id: execution_id.clone(),
            })
            .await;

        let budget = Duration::from_millis(flow.settings.max_execution_time);
        let mut run = Run::new(flow, execution_id, input.unwrap_or(Value::Null));

        let outcome = match tokio::time::timeout(budget, self.walk(&mut run)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Abort {
                kind: ExecutionErrorKind::Timeout,
                message: format!(
                    "Flow execution timeout after {}ms",
                    flow.settings.max_execution_time
                ),
            }),
        };

        let duration_ms = clock.elapsed().as_millis() as u64;
        let (status, error, error_kind) = match outcome {
            Ok(()) => {
                info!(
                    flow_id = %flow.id,
                    execution_id = %run.execution_id,
                    nodes = run.executed.len(),
                    duration_ms,
                    "Flow execution completed"
                );
                self.hooks
                    .emit(&HookEvent::FlowCompleted {
                        flow_id: flow.id.clone(),
                        execution_id: run.execution_id.clone(),
                        duration_ms,
                    })
                    .await;
                (ExecutionStatus::Completed, None, None)
            }
            Err(abort) => {
                error!(
                    flow_id = %flow.id,
                    execution_id = %run.execution_id,
                    error = %abort.message,
                    "Flow execution failed"
                );
                self.hooks
                    .emit(&HookEvent::FlowFailed {
                        flow_id: flow.id.clone(),
                        execution_id: run.execution_id.clone(),
                        error: abort.message.clone(),
                    })
                    .await;
                (ExecutionStatus::Failed, Some(abort.message), Some(abort.kind))
            }
        };

        ExecutionResult {
            output: run.final_output(),
            execution_id: run.execution_id,
            flow_id: flow.id.clone(),
            status,
            node_results: run.node_results,
            executed_nodes: run.executed,
            error,
            error_kind,
            validation_errors: Vec::new(),
            started_at,
            finished_at: Utc::now(),
            duration_ms,
        }
    }

    async fn walk<'f>(&self, run: &mut Run<'f>) -> Result<(), Abort> {
        let flow = run.flow;
        let trigger = flow.trigger().ok_or_else(|| Abort {
            kind: ExecutionErrorKind::Internal,
            message: "Flow has no trigger node".to_string(),
        })?;

        let mut ready: VecDeque<&'f Node> = VecDeque::from([trigger]);
        run.scheduled.insert(trigger.id.as_str());

        while let Some(node) = ready.pop_front() {
            let selection = match &node.data {
                NodeData::Trigger(_) => {
                    let input = run.input.clone();
                    self.record(run, node, input).await;
                    Selection::All
                }
                NodeData::Action(data) => self.run_action(run, node, data).await?,
                NodeData::Condition(data) => self.run_condition(run, node, data).await,
                NodeData::Output(data) => {
                    self.run_output(run, node, data).await;
                    Selection::All
                }
            };

            for edge in flow.outgoing(&node.id) {
                let taken = match selection {
                    Selection::All => true,
                    Selection::Handle(handle) => edge_handle(node, edge) == handle,
                };
                run.taken.insert(edge.id.as_str(), taken);
                self.settle(run, &edge.target, &mut ready);
            }
        }
        Ok(())
    }

    /// Schedule `target` once its incoming edges are all resolved, pruning
    /// it (and transitively its successors) when none of them was taken.
    fn settle<'f>(&self, run: &mut Run<'f>, target: &'f str, ready: &mut VecDeque<&'f Node>) {
        let flow = run.flow;
        let mut pending = vec![target];
        while let Some(id) = pending.pop() {
            if run.scheduled.contains(id) {
                continue;
            }
            let mut resolved = true;
            let mut any_taken = false;
            for edge in flow.incoming(id) {
                match run.taken.get(edge.id.as_str()) {
                    Some(true) => any_taken = true,
                    Some(false) => {}
                    None => {
                        resolved = false;
                        break;
                    }
                }
            }
            if !resolved {
                continue;
            }

            run.scheduled.insert(id);
            if any_taken {
                if let Some(node) = flow.node(id) {
                    ready.push_back(node);
                }
            } else {
                debug!(flow_id = %flow.id, node_id = %id, "Pruned node");
                for edge in flow.outgoing(id) {
                    run.taken.insert(edge.id.as_str(), false);
                    pending.push(edge.target.as_str());
                }
            }
        }
    }

    async fn record<'f>(&self, run: &mut Run<'f>, node: &'f Node, result: Value) {
        debug!(
            flow_id = %run.flow.id,
            execution_id = %run.execution_id,
            node_id = %node.id,
            node_type = %node.node_type(),
            "Node completed"
        );
        run.node_results.insert(node.id.clone(), result.clone());
        run.executed.push(node.id.clone());
        self.hooks
            .emit(&HookEvent::NodeCompleted {
                flow_id: run.flow.id.clone(),
                execution_id: run.execution_id.clone(),
                node_id: node.id.clone(),
                result,
            })
            .await;
    }

    async fn run_action<'f>(
        &self,
        run: &mut Run<'f>,
        node: &'f Node,
        data: &ActionData,
    ) -> Result<Selection<'static>, Abort> {
        let mut input = run.snapshot();
        if let (Value::Object(target), Value::Object(params)) = (&mut input, &data.params) {
            target.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let result = self.call_with_retry(run, node, data, input).await;
        if result.success {
            let value = result.data.unwrap_or(Value::Null);
            self.record(run, node, value).await;
            return Ok(Selection::Handle(HANDLE_OUTPUT));
        }

        let message = result
            .error
            .unwrap_or_else(|| format!("{} returned an unsuccessful result", data.qualified_name()));
        warn!(
            flow_id = %run.flow.id,
            execution_id = %run.execution_id,
            node_id = %node.id,
            error = %message,
            "Action node failed"
        );
        self.hooks
            .emit(&HookEvent::NodeFailed {
                flow_id: run.flow.id.clone(),
                execution_id: run.execution_id.clone(),
                node_id: node.id.clone(),
                error: message.clone(),
            })
            .await;

        let has_error_edge = run
            .flow
            .outgoing(&node.id)
            .any(|e| e.action_handle() == HANDLE_ERROR);
        if has_error_edge {
            let value = serde_json::json!({ "success": false, "error": message });
            self.record(run, node, value).await;
            Ok(Selection::Handle(HANDLE_ERROR))
        } else {
            run.node_results
                .insert(node.id.clone(), serde_json::json!({ "success": false, "error": message }));
            run.executed.push(node.id.clone());
            Err(Abort {
                kind: ExecutionErrorKind::Action,
                message: format!("Node '{}' failed: {}", node.id, message),
            })
        }
    }

    /// Call the collaborator. Transient errors (not `success: false`) are
    /// retried with doubling backoff when the flow allows it. Any error left
    /// over becomes a failed result.
    async fn call_with_retry(&self, run: &Run<'_>, node: &Node, data: &ActionData, input: Value) -> ActionResult {
        let name = data.qualified_name();
        let attempts = if run.flow.settings.retry_on_failure {
            self.config.max_node_retries + 1
        } else {
            1
        };
        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);

        let mut attempt = 1;
        loop {
            let outcome = match data.kind {
                ActionKind::Action => self.executor.execute_action(&name, input.clone()).await,
                ActionKind::Provider => self.executor.get_data(&name, input.clone()).await,
            };
            match outcome {
                Ok(result) => return result,
                Err(e) if attempt < attempts && e.is_transient() => {
                    warn!(
                        node_id = %node.id,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Node call failed, retrying in {:?}",
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    return ActionResult::fail(format!("{} (after {} attempt(s))", e, attempt));
                }
            }
        }
    }

    async fn run_condition<'f>(&self, run: &mut Run<'f>, node: &'f Node, data: &ConditionData) -> Selection<'static> {
        let snapshot = run.snapshot();
        let evaluation = self
            .evaluator
            .evaluate(&data.group(), &snapshot, Some(run.flow.id.as_str()));
        debug!(node_id = %node.id, met = evaluation.met, "Condition evaluated");

        let handle = if evaluation.met { HANDLE_TRUE } else { HANDLE_FALSE };
        let value = serde_json::to_value(&evaluation).unwrap_or(Value::Null);
        self.record(run, node, value).await;
        Selection::Handle(handle)
    }

    async fn run_output<'f>(&self, run: &mut Run<'f>, node: &'f Node, data: &OutputData) {
        let value = run.incoming_value(&node.id);
        if data.output_type == OutputType::Log {
            log_output(run.flow, node, &value);
            self.hooks
                .emit(&HookEvent::OutputLogged {
                    flow_id: run.flow.id.clone(),
                    node_id: node.id.clone(),
                    value: value.clone(),
                })
                .await;
        }
        run.outputs.push((node.id.clone(), value.clone()));
        self.record(run, node, value).await;
    }
}

fn edge_handle<'a>(node: &Node, edge: &'a Edge) -> &'a str {
    match node.data {
        NodeData::Action(_) => edge.action_handle(),
        _ => edge.source_handle.as_deref().unwrap_or(""),
    }
}

fn log_output(flow: &Flow, node: &Node, value: &Value) {
    match flow.settings.log_level {
        LogLevel::Debug => debug!(flow_id = %flow.id, node_id = %node.id, output = %value, "Flow output"),
        LogLevel::Info => info!(flow_id = %flow.id, node_id = %node.id, output = %value, "Flow output"),
        LogLevel::Warn => warn!(flow_id = %flow.id, node_id = %node.id, output = %value, "Flow output"),
        LogLevel::Error => error!(flow_id = %flow.id, node_id = %node.id, output = %value, "Flow output"),
    }
}

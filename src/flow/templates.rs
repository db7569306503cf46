//! Built-in flow templates

use serde_json::json;

use super::model::{
    Edge, FlowDraft, Node, OutputType, TriggerData, Variable, VariableType, HANDLE_ERROR, HANDLE_FALSE,
    HANDLE_OUTPUT, HANDLE_TRUE,
};
use crate::condition::{ComparisonOperator, Condition, ConditionGroup};

/// A named recipe for a starter flow
#[derive(Debug, Clone, Copy)]
pub struct FlowTemplate {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    build: fn() -> FlowDraft,
}

impl FlowTemplate {
    pub fn draft(&self) -> FlowDraft {
        (self.build)()
    }
}

const TEMPLATES: &[FlowTemplate] = &[
    FlowTemplate {
        id: "simple-action",
        name: "Simple Action",
        description: "Run one action when triggered and return its result",
        build: simple_action,
    },
    FlowTemplate {
        id: "conditional",
        name: "Conditional",
        description: "Fetch data, branch on a condition, act only when it holds",
        build: conditional,
    },
    FlowTemplate {
        id: "error-handling",
        name: "Error Handling",
        description: "Route a failed action to a notification branch",
        build: error_handling,
    },
    FlowTemplate {
        id: "scheduled",
        name: "Scheduled",
        description: "Run an action every hour and log the result",
        build: scheduled,
    },
];

pub fn templates() -> &'static [FlowTemplate] {
    TEMPLATES
}

pub fn template(id: &str) -> Option<&'static FlowTemplate> {
    TEMPLATES.iter().find(|t| t.id == id)
}

fn simple_action() -> FlowDraft {
    FlowDraft::new("Simple Action")
        .description("Run one action when triggered")
        .node(Node::trigger("trigger", "Manual Trigger", TriggerData::manual()))
        .node(Node::action("action", "Run Action", "paper", "notify", json!({ "message": "triggered" })))
        .node(Node::output("output", "Result", OutputType::Return))
        .edge(Edge::new("trigger", "action"))
        .edge(Edge::new("action", "output").with_handle(HANDLE_OUTPUT))
}

fn conditional() -> FlowDraft {
    FlowDraft::new("Conditional")
        .description("Buy when the price drops below the threshold")
        .variable(Variable {
            name: "token".to_string(),
            var_type: VariableType::String,
            default_value: Some(json!("ETH")),
            description: Some("Token to watch".to_string()),
        })
        .node(Node::trigger("trigger", "Manual Trigger", TriggerData::manual()))
        .node(Node::provider("get-price", "Get Price", "paper", "price", json!({ "token": "ETH" })))
        .node(Node::condition(
            "check",
            "Price Below Threshold",
            ConditionGroup::all([Condition::new("price", ComparisonOperator::Lt, 3000)]),
        ))
        .node(Node::action(
            "buy",
            "Buy",
            "paper",
            "swap",
            json!({ "buyToken": "ETH", "sellToken": "USDC", "amount": "100" }),
        ))
        .node(Node::output("output", "Result", OutputType::Return))
        .edge(Edge::new("trigger", "get-price"))
        .edge(Edge::new("get-price", "check").with_handle(HANDLE_OUTPUT))
        .edge(Edge::new("check", "buy").with_handle(HANDLE_TRUE).with_label("below"))
        .edge(Edge::new("check", "output").with_handle(HANDLE_FALSE).with_label("above"))
        .edge(Edge::new("buy", "output").with_handle(HANDLE_OUTPUT))
}

fn error_handling() -> FlowDraft {
    FlowDraft::new("Error Handling")
        .description("Notify when the action fails")
        .node(Node::trigger("trigger", "Manual Trigger", TriggerData::manual()))
        .node(Node::action(
            "action",
            "Swap",
            "paper",
            "swap",
            json!({ "buyToken": "ETH", "sellToken": "USDC", "amount": "100" }),
        ))
        .node(Node::output("success", "Success", OutputType::Return))
        .node(Node::action(
            "notify-error",
            "Notify Failure",
            "paper",
            "notify",
            json!({ "message": "swap failed" }),
        ))
        .node(Node::output("failure", "Failure", OutputType::Log))
        .edge(Edge::new("trigger", "action"))
        .edge(Edge::new("action", "success").with_handle(HANDLE_OUTPUT))
        .edge(Edge::new("action", "notify-error").with_handle(HANDLE_ERROR))
        .edge(Edge::new("notify-error", "failure").with_handle(HANDLE_OUTPUT))
}

fn scheduled() -> FlowDraft {
    FlowDraft::new("Scheduled")
        .description("Hourly price snapshot")
        .node(Node::trigger("trigger", "Hourly", TriggerData::cron("@hourly")))
        .node(Node::provider("get-price", "Get Price", "paper", "price", json!({ "token": "ETH" })))
        .node(Node::output("log", "Log Price", OutputType::Log))
        .edge(Edge::new("trigger", "get-price"))
        .edge(Edge::new("get-price", "log").with_handle(HANDLE_OUTPUT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::validation::validate;

    #[test]
    fn test_builtin_templates_are_valid() {
        let expected = [
            ("simple-action", 3, 2),
            ("conditional", 5, 5),
            ("error-handling", 5, 4),
            ("scheduled", 3, 2),
        ];

        for (id, nodes, edges) in expected {
            let flow = template(id).unwrap().draft().build();
            assert_eq!(flow.nodes.len(), nodes, "{id} node count");
            assert_eq!(flow.edges.len(), edges, "{id} edge count");
            let report = validate(&flow);
            assert!(report.valid, "{id}: {:?}", report.errors);
        }
        assert_eq!(templates().len(), 4);
        assert!(template("nope").is_none());
    }
}

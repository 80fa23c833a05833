//! Agent tool calls: the `updateOrder` declaration and its handling.
//!
//! The agent adds items to the cart by calling `updateOrder` with a list of
//! `{itemName, quantity}` objects. Names are resolved against the menu with a
//! case-insensitive substring match; unknown names are kept as spoken and
//! priced at zero so staff can fix them at the counter.

use kiosk_core::{Menu, OrderLine};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Name of the cart-update function advertised to the agent.
pub const UPDATE_ORDER: &str = "updateOrder";

/// Result string reported for every `updateOrder` call.
pub const UPDATE_ORDER_ACK: &str = "Order cart updated successfully";

/// A function declaration advertised at session setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

/// Declaration of the `updateOrder` tool.
pub fn update_order_declaration() -> FunctionDeclaration {
    FunctionDeclaration {
        name: UPDATE_ORDER.to_string(),
        description: Some("Add items the customer ordered to their cart.".to_string()),
        parameters: json!({
            "type": "OBJECT",
            "description": "Update the customer's order cart with items.",
            "properties": {
                "items": {
                    "type": "ARRAY",
                    "description": "List of items to add or update",
                    "items": {
                        "type": "OBJECT",
                        "properties": {
                            "itemName": {
                                "type": "STRING",
                                "description": "Name of the item from the menu"
                            },
                            "quantity": {
                                "type": "NUMBER",
                                "description": "Quantity of the item"
                            }
                        },
                        "required": ["itemName", "quantity"]
                    }
                }
            },
            "required": ["items"]
        }),
    }
}

/// One function call requested by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Reply correlated to a [`ToolInvocation`] by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

impl ToolResponse {
    /// Fixed-shape success reply for `invocation`.
    pub fn acknowledge(invocation: &ToolInvocation) -> Self {
        Self::with_result(invocation, UPDATE_ORDER_ACK)
    }

    /// Reply for a function this kiosk does not provide.
    pub fn unsupported(invocation: &ToolInvocation) -> Self {
        Self::with_result(
            invocation,
            &format!("Function {} is not available", invocation.name),
        )
    }

    fn with_result(invocation: &ToolInvocation, result: &str) -> Self {
        Self {
            id: invocation.id.clone(),
            name: invocation.name.clone(),
            response: json!({ "result": result }),
        }
    }
}

/// What handling one invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    /// Lines to hand to the order-update callback (may be empty).
    pub lines: Vec<OrderLine>,
    /// Exactly one response per invocation.
    pub response: ToolResponse,
}

/// Handle one invocation against the menu.
pub fn handle_invocation(invocation: &ToolInvocation, menu: &Menu) -> ToolOutcome {
    if invocation.name != UPDATE_ORDER {
        tracing::warn!(
            call_id = %invocation.id,
            name = %invocation.name,
            "Unsupported tool call"
        );
        return ToolOutcome {
            lines: Vec::new(),
            response: ToolResponse::unsupported(invocation),
        };
    }

    let lines = resolve_order_lines(&invocation.args, menu);
    tracing::info!(
        call_id = %invocation.id,
        lines = lines.len(),
        "updateOrder resolved"
    );
    ToolOutcome {
        lines,
        response: ToolResponse::acknowledge(invocation),
    }
}

/// Turn `updateOrder` arguments into order lines.
///
/// Items without a non-empty string `itemName` are skipped. A missing,
/// non-numeric or sub-1 quantity counts as 1; fractional quantities round.
pub fn resolve_order_lines(args: &Value, menu: &Menu) -> Vec<OrderLine> {
    let Some(items) = args.get("items").and_then(Value::as_array) else {
        tracing::warn!("updateOrder call without an items list");
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let Some(name) = item.get("itemName").and_then(Value::as_str) else {
                tracing::debug!(%item, "Skipping order item without itemName");
                return None;
            };
            let name = name.trim();
            if name.is_empty() {
                tracing::debug!("Skipping order item with empty itemName");
                return None;
            }

            let quantity = parse_quantity(item.get("quantity"));
            let line = match menu.resolve(name) {
                Some(menu_item) => OrderLine::new(menu_item.name.clone(), menu_item.price, quantity),
                None => {
                    tracing::info!(item = name, "Ordered item not on the menu");
                    OrderLine::new(name, 0, quantity)
                }
            };
            Some(line)
        })
        .collect()
}

fn parse_quantity(value: Option<&Value>) -> u32 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match raw.map(f64::round) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(q) if q >= 1.0 => q.min(f64::from(u32::MAX)) as u32,
        _ => 1,
    }
}

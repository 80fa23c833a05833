//! Order lines, the cart they accumulate into, and the bill.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::SessionObserver;

/// One line in the customer's cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    /// Fresh identifier, unique per synthesized line.
    pub id: String,
    pub name: String,
    /// Unit price in whole rupees. Zero when the item is not on the menu.
    pub price: u32,
    pub quantity: u32,
}

impl OrderLine {
    pub fn new(name: impl Into<String>, price: u32, quantity: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            price,
            quantity,
        }
    }

    pub const fn subtotal(&self) -> u64 {
        self.price as u64 * self.quantity as u64
    }
}

/// Ordered list of order lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    lines: Vec<OrderLine>,
}

impl Cart {
    pub const fn new() -> Self {
        Self { lines: Vec::new() }
    }

    /// Append lines in the order the agent reported them.
    pub fn add_lines(&mut self, lines: impl IntoIterator<Item = OrderLine>) {
        self.lines.extend(lines);
    }

    /// Remove the line at `index`. Out-of-range indices are ignored.
    pub fn remove(&mut self, index: usize) -> Option<OrderLine> {
        (index < self.lines.len()).then(|| self.lines.remove(index))
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Sum of price × quantity over all lines.
    pub fn total(&self) -> u64 {
        self.lines.iter().map(OrderLine::subtotal).sum()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Snapshot of a confirmed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bill {
    pub lines: Vec<OrderLine>,
    pub total: u64,
}

/// Host-side cart fed by order-update notifications from a live session.
///
/// Shared between the session task (which appends) and the kiosk front end
/// (which edits, confirms and resets), so every method takes `&self`.
#[derive(Debug, Default)]
pub struct OrderDesk {
    cart: Mutex<Cart>,
}

impl OrderDesk {
    pub fn new() -> Self {
        Self::default()
    }

    fn cart(&self) -> MutexGuard<'_, Cart> {
        self.cart.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lines(&self) -> Vec<OrderLine> {
        self.cart().lines().to_vec()
    }

    pub fn total(&self) -> u64 {
        self.cart().total()
    }

    pub fn remove(&self, index: usize) -> Option<OrderLine> {
        self.cart().remove(index)
    }

    /// Freeze the current cart into a bill. The cart is left untouched until
    /// [`OrderDesk::reset`] so the bill can be shown alongside it.
    pub fn confirm(&self) -> Bill {
        let cart = self.cart();
        let bill = Bill {
            lines: cart.lines().to_vec(),
            total: cart.total(),
        };
        tracing::info!(lines = bill.lines.len(), total = bill.total, "Order confirmed");
        bill
    }

    /// Start over for the next customer.
    pub fn reset(&self) {
        self.cart().clear();
    }
}

impl SessionObserver for OrderDesk {
    fn on_order_update(&self, lines: Vec<OrderLine>) {
        tracing::debug!(added = lines.len(), "Cart updated");
        self.cart().add_lines(lines);
    }
}

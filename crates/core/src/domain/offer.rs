use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::money::format_brl;

/// An installment plan offered by a creditor.
///
/// `raw` keeps the record exactly as the offer lookup returned it; agreement
/// registration sends it back untouched as the chosen plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub description: String,
    pub installments: u32,
    pub installment_amount: Option<Decimal>,
    pub total_amount: Option<Decimal>,
    pub first_due_date: Option<String>,
    pub raw: Value,
}

impl Offer {
    /// One-line summary such as `Plano 3x - 3x de R$ 100,00 (total R$ 300,00)`.
    pub fn summary(&self) -> String {
        let mut summary = self.description.clone();
        match (self.installment_amount, self.total_amount) {
            (Some(amount), Some(total)) => summary.push_str(&format!(
                " - {}x de {} (total {})",
                self.installments,
                format_brl(amount),
                format_brl(total)
            )),
            (Some(amount), None) => {
                summary.push_str(&format!(" - {}x de {}", self.installments, format_brl(amount)))
            }
            (None, Some(total)) => summary.push_str(&format!(
                " - {}x, total {}",
                self.installments,
                format_brl(total)
            )),
            (None, None) => summary.push_str(&format!(" - {}x", self.installments)),
        }
        if let Some(due_date) = &self.first_due_date {
            summary.push_str(&format!(", primeiro vencimento {due_date}"));
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::Offer;

    #[test]
    fn summary_includes_known_amounts_only() {
        let offer = Offer {
            description: "Parcelado".to_string(),
            installments: 3,
            installment_amount: Some(Decimal::new(10_000, 2)),
            total_amount: Some(Decimal::new(30_000, 2)),
            first_due_date: Some("2026-11-10".to_string()),
            raw: json!({}),
        };
        assert_eq!(
            offer.summary(),
            "Parcelado - 3x de R$ 100,00 (total R$ 300,00), primeiro vencimento 2026-11-10"
        );

        let bare = Offer { installment_amount: None, total_amount: None, first_due_date: None, ..offer };
        assert_eq!(bare.summary(), "Parcelado - 3x");
    }
}

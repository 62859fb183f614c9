use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::money::format_brl;
use crate::domain::offer::Offer;

/// Everything the agreement registration needs; the gateway decides which key
/// (creditor id or document) its deployment expects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgreementRequest {
    pub document: String,
    pub creditor_external_id: String,
    pub offer: Offer,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgreementInstallment {
    pub number: u32,
    pub due_date: Option<String>,
    pub amount: Option<Decimal>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLink {
    pub label: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgreementResult {
    pub agreement_id: Option<String>,
    pub installments: Vec<AgreementInstallment>,
    pub payment_links: Vec<PaymentLink>,
    pub payment_code: Option<String>,
    pub raw: Value,
}

impl AgreementResult {
    /// Human-readable confirmation with the installment schedule and payment data.
    pub fn summary(&self) -> String {
        let mut lines = vec![match &self.agreement_id {
            Some(id) => format!("Acordo {id} registrado com sucesso."),
            None => "Acordo registrado com sucesso.".to_string(),
        }];

        if !self.installments.is_empty() {
            lines.push("Parcelas:".to_string());
            for installment in &self.installments {
                let mut line = format!("{}ª parcela", installment.number);
                if let Some(amount) = installment.amount {
                    line.push_str(&format!(": {}", format_brl(amount)));
                }
                if let Some(due_date) = &installment.due_date {
                    line.push_str(&format!(", vencimento {due_date}"));
                }
                lines.push(line);
            }
        }

        for link in &self.payment_links {
            lines.push(format!("{}: {}", link.label, link.url));
        }
        if let Some(code) = &self.payment_code {
            lines.push(format!("Código para pagamento: {code}"));
        }

        lines.join("\n")
    }
}

use serde::{Deserialize, Serialize};

/// A creditor entry as returned by the debt lookup, already normalized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creditor {
    pub name: String,
    pub company: String,
    pub external_id: String,
}

impl Creditor {
    pub fn new(
        name: impl Into<String>,
        company: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self { name: name.into(), company: company.into(), external_id: external_id.into() }
    }

    /// Display label; the company is only shown when it adds information.
    pub fn label(&self) -> String {
        if self.company.is_empty() || self.company.eq_ignore_ascii_case(&self.name) {
            self.name.clone()
        } else {
            format!("{} ({})", self.name, self.company)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Creditor;

    #[test]
    fn label_omits_company_when_redundant() {
        assert_eq!(Creditor::new("Banco Azul", "banco azul", "77").label(), "Banco Azul");
        assert_eq!(
            Creditor::new("Cartao Gold", "Banco Azul", "78").label(),
            "Cartao Gold (Banco Azul)"
        );
    }
}

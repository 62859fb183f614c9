//! External debt services: creditor listing, offer lookup and agreement registration.
//!
//! Responses are read into permissive raw schemas (every field optional, Portuguese
//! and English spellings side by side) and normalized once here, so the rest of
//! the agent only ever sees `Creditor`, `Offer` and `AgreementResult`.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use negocia_core::config::{AgreementKey, GatewayConfig};
use negocia_core::{AgreementInstallment, AgreementRequest, AgreementResult, Creditor, Offer, PaymentLink};
use reqwest::{Client, Response};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

#[async_trait]
pub trait DebtGateway: Send + Sync {
    /// Creditors holding debts for an 11- or 14-digit document, in service order.
    async fn list_creditors(&self, document: &str) -> Result<Vec<Creditor>>;
    async fn list_offers(&self, creditor: &Creditor) -> Result<Vec<Offer>>;
    async fn register_agreement(&self, request: &AgreementRequest) -> Result<AgreementResult>;
}

pub struct HttpDebtGateway {
    client: Client,
    base_url: String,
    username: String,
    password: SecretString,
    agreement_key: AgreementKey,
}

impl HttpDebtGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build gateway http client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            agreement_key: config.agreement_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn issue_token(&self) -> Result<String> {
        let body = json!({
            "username": self.username,
            "password": self.password.expose_secret(),
        });
        let response = self
            .client
            .post(self.url("/gerar-token"))
            .json(&body)
            .send()
            .await
            .context("token issuance request failed")?;

        let payload = read_json(response, "token issuance").await?;
        extract_token(&payload).ok_or_else(|| anyhow!("token issuance returned no token"))
    }
}

#[async_trait]
impl DebtGateway for HttpDebtGateway {
    async fn list_creditors(&self, document: &str) -> Result<Vec<Creditor>> {
        let response = self
            .client
            .get(self.url("/lista-credores"))
            .query(&[("documento", document)])
            .send()
            .await
            // keeps the document out of error messages
            .map_err(reqwest::Error::without_url)
            .context("creditor lookup request failed")?;

        let payload = read_json(response, "creditor lookup").await?;
        Ok(normalize_creditors(&payload))
    }

    async fn list_offers(&self, creditor: &Creditor) -> Result<Vec<Offer>> {
        let response = self
            .client
            .get(self.url("/credores/oferta-parcelas"))
            .query(&[("iddevedor", creditor.external_id.as_str())])
            .send()
            .await
            .context("offer lookup request failed")?;

        let payload = read_json(response, "offer lookup").await?;
        Ok(normalize_offers(&payload))
    }

    async fn register_agreement(&self, request: &AgreementRequest) -> Result<AgreementResult> {
        let token = self.issue_token().await?;
        let body = agreement_body(self.agreement_key, request);

        debug!(
            event_name = "negotiation.agreement_request",
            agreement_key = self.agreement_key.as_str(),
            creditor_id = %request.creditor_external_id,
            "registering agreement"
        );

        let response = self
            .client
            .post(self.url("/registro-master-acordo"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .context("agreement registration request failed")?;

        let payload = read_json(response, "agreement registration").await?;
        normalize_agreement(payload)
    }
}

async fn read_json(response: Response, operation: &str) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .await
        .with_context(|| format!("failed to read {operation} response body"))?;

    if !status.is_success() {
        return Err(anyhow!("{operation} returned HTTP {status}: {body}"));
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_str(&body).with_context(|| format!("failed to parse {operation} response"))
}

fn agreement_body(key: AgreementKey, request: &AgreementRequest) -> Value {
    match key {
        AgreementKey::CreditorId => json!({
            "iddevedor": request.creditor_external_id,
            "plano": request.offer.raw,
        }),
        AgreementKey::Document => json!({
            "documento": request.document,
            "plano": request.offer.raw,
        }),
    }
}

fn extract_token(payload: &Value) -> Option<String> {
    let token = match payload {
        Value::String(token) => Some(token.as_str()),
        Value::Object(map) => ["accessToken", "access_token", "token"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str)),
        _ => None,
    }?;

    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// The list itself, or the first array found under a known envelope key.
fn list_items(payload: &Value) -> &[Value] {
    const ENVELOPE_KEYS: [&str; 6] = ["data", "credores", "ofertas", "parcelas", "result", "items"];

    match payload {
        Value::Array(items) => items,
        Value::Object(map) => ENVELOPE_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    }
}

fn parse_items<T: DeserializeOwned>(payload: &Value, kind: &str) -> Vec<(T, Value)> {
    list_items(payload)
        .iter()
        .enumerate()
        .filter_map(|(position, item)| match serde_json::from_value::<T>(item.clone()) {
            Ok(parsed) => Some((parsed, item.clone())),
            Err(error) => {
                warn!(
                    event_name = "negotiation.gateway_record_skipped",
                    kind,
                    position,
                    error = %error,
                    "skipping unreadable gateway record"
                );
                None
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawText {
    Text(String),
    Number(serde_json::Number),
}

impl RawText {
    fn into_string(self) -> Option<String> {
        let value = match self {
            Self::Text(text) => text.trim().to_string(),
            Self::Number(number) => number.to_string(),
        };
        (!value.is_empty()).then_some(value)
    }

    fn to_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Number(number) => Decimal::from_str(&number.to_string())
                .or_else(|_| Decimal::from_scientific(&number.to_string()))
                .ok(),
            Self::Text(text) => parse_brl_amount(text),
        }
    }

    fn to_count(&self) -> Option<u32> {
        match self {
            Self::Number(number) => number.as_u64().and_then(|value| u32::try_from(value).ok()),
            Self::Text(text) => {
                let digits = text.trim().trim_end_matches(|ch: char| ch == 'x' || ch == 'X');
                digits.trim().parse::<u32>().ok()
            }
        }
    }
}

/// Accepts `1234.56`, `1.234,56` and `R$ 1.234,56`.
fn parse_brl_amount(text: &str) -> Option<Decimal> {
    let cleaned = text.trim().trim_start_matches("R$").trim().replace(' ', "");
    if cleaned.is_empty() {
        return None;
    }

    let normalized =
        if cleaned.contains(',') { cleaned.replace('.', "").replace(',', ".") } else { cleaned };
    Decimal::from_str(&normalized).ok()
}

fn first_text(candidates: impl IntoIterator<Item = Option<RawText>>) -> Option<String> {
    candidates.into_iter().flatten().find_map(RawText::into_string)
}

fn first_amount(candidates: [&Option<RawText>; 3]) -> Option<Decimal> {
    candidates.into_iter().flatten().find_map(RawText::to_decimal)
}

#[derive(Debug, Default, Deserialize)]
struct RawCreditor {
    nome: Option<RawText>,
    name: Option<RawText>,
    credor: Option<RawText>,
    empresa: Option<RawText>,
    company: Option<RawText>,
    iddevedor: Option<RawText>,
    #[serde(rename = "idDevedor")]
    id_devedor: Option<RawText>,
    id: Option<RawText>,
}

fn normalize_creditors(payload: &Value) -> Vec<Creditor> {
    parse_items::<RawCreditor>(payload, "creditor")
        .into_iter()
        .enumerate()
        .filter_map(|(position, (raw, _))| {
            let Some(external_id) = first_text([raw.iddevedor, raw.id_devedor, raw.id]) else {
                warn!(
                    event_name = "negotiation.gateway_record_skipped",
                    kind = "creditor",
                    position,
                    "creditor record has no identifier; it cannot be used for offer lookup"
                );
                return None;
            };

            let company = first_text([raw.empresa, raw.company]);
            let credor = first_text([raw.credor]);
            let name = first_text([raw.nome, raw.name])
                .or_else(|| credor.clone())
                .or_else(|| company.clone())
                .unwrap_or_else(|| format!("Credor {external_id}"));
            let company = company.or(credor).unwrap_or_else(|| name.clone());

            Some(Creditor { name, company, external_id })
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct RawOffer {
    descricao: Option<RawText>,
    description: Option<RawText>,
    plano: Option<RawText>,
    parcelas: Option<RawText>,
    #[serde(rename = "quantidadeParcelas")]
    quantidade_parcelas: Option<RawText>,
    installments: Option<RawText>,
    #[serde(rename = "valorParcela")]
    valor_parcela_camel: Option<RawText>,
    valor_parcela: Option<RawText>,
    installment_amount: Option<RawText>,
    #[serde(rename = "valorTotal")]
    valor_total_camel: Option<RawText>,
    valor_total: Option<RawText>,
    total: Option<RawText>,
    vencimento: Option<RawText>,
    #[serde(rename = "primeiroVencimento")]
    primeiro_vencimento: Option<RawText>,
    first_due_date: Option<RawText>,
}

fn normalize_offers(payload: &Value) -> Vec<Offer> {
    parse_items::<RawOffer>(payload, "offer")
        .into_iter()
        .map(|(raw, original)| {
            let installments = [&raw.parcelas, &raw.quantidade_parcelas, &raw.installments]
                .into_iter()
                .flatten()
                .find_map(RawText::to_count)
                .filter(|count| *count > 0)
                .unwrap_or(1);
            let installment_amount = first_amount([
                &raw.valor_parcela_camel,
                &raw.valor_parcela,
                &raw.installment_amount,
            ]);
            let total_amount =
                first_amount([&raw.valor_total_camel, &raw.valor_total, &raw.total]).or_else(|| {
                    installment_amount.map(|amount| amount * Decimal::from(installments))
                });
            let description = first_text([raw.descricao, raw.description, raw.plano])
                .unwrap_or_else(|| {
                    if installments == 1 {
                        "Pagamento à vista".to_string()
                    } else {
                        format!("Parcelado em {installments}x")
                    }
                });
            let first_due_date =
                first_text([raw.vencimento, raw.primeiro_vencimento, raw.first_due_date]);

            Offer {
                description,
                installments,
                installment_amount,
                total_amount,
                first_due_date,
                raw: original,
            }
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct RawAgreement {
    #[serde(rename = "idAcordo")]
    id_acordo_camel: Option<RawText>,
    idacordo: Option<RawText>,
    id: Option<RawText>,
    agreement_id: Option<RawText>,
    #[serde(default)]
    parcelas: Vec<RawInstallment>,
    #[serde(default)]
    installments: Vec<RawInstallment>,
    boleto: Option<RawText>,
    #[serde(rename = "linkBoleto")]
    link_boleto: Option<RawText>,
    pix: Option<RawText>,
    #[serde(rename = "linkPix")]
    link_pix: Option<RawText>,
    link: Option<RawText>,
    url: Option<RawText>,
    #[serde(rename = "linhaDigitavel")]
    linha_digitavel: Option<RawText>,
    codigo: Option<RawText>,
    #[serde(rename = "pixCopiaECola")]
    pix_copia_e_cola: Option<RawText>,
    payment_code: Option<RawText>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInstallment {
    numero: Option<RawText>,
    parcela: Option<RawText>,
    number: Option<RawText>,
    vencimento: Option<RawText>,
    due_date: Option<RawText>,
    valor: Option<RawText>,
    amount: Option<RawText>,
}

/// Some deployments wrap the registration result in a `data`/`acordo` object.
fn agreement_record(payload: &Value) -> &Value {
    ["acordo", "data", "result"]
        .iter()
        .find_map(|key| payload.get(*key).filter(|inner| inner.is_object()))
        .unwrap_or(payload)
}

/// Fails when the payload names no agreement, schedule or payment reference;
/// the gateway answers some rejections with 2xx and an error body.
fn normalize_agreement(payload: Value) -> Result<AgreementResult> {
    let raw = serde_json::from_value::<RawAgreement>(agreement_record(&payload).clone())
        .unwrap_or_else(|error| {
            warn!(
                event_name = "negotiation.gateway_record_skipped",
                kind = "agreement",
                error = %error,
                "agreement response did not match the expected shape"
            );
            RawAgreement::default()
        });

    let schedule = if raw.parcelas.is_empty() { raw.installments } else { raw.parcelas };
    let installments = schedule
        .into_iter()
        .enumerate()
        .map(|(position, item)| {
            let fallback = u32::try_from(position + 1).unwrap_or(u32::MAX);
            AgreementInstallment {
                number: [&item.numero, &item.parcela, &item.number]
                    .into_iter()
                    .flatten()
                    .find_map(RawText::to_count)
                    .unwrap_or(fallback),
                amount: [&item.valor, &item.amount].into_iter().flatten().find_map(RawText::to_decimal),
                due_date: first_text([item.vencimento, item.due_date]),
            }
        })
        .collect();

    let mut payment_links = Vec::new();
    if let Some(url) = first_text([raw.link_boleto, raw.boleto]) {
        payment_links.push(PaymentLink { label: "Boleto".to_string(), url });
    }
    if let Some(url) = first_text([raw.link_pix, raw.pix]) {
        payment_links.push(PaymentLink { label: "Pix".to_string(), url });
    }
    if let Some(url) = first_text([raw.link, raw.url]) {
        payment_links.push(PaymentLink { label: "Link de pagamento".to_string(), url });
    }

    let result = AgreementResult {
        agreement_id: first_text([raw.id_acordo_camel, raw.idacordo, raw.agreement_id, raw.id]),
        installments,
        payment_links,
        payment_code: first_text([
            raw.linha_digitavel,
            raw.codigo,
            raw.pix_copia_e_cola,
            raw.payment_code,
        ]),
        raw: payload,
    };

    if result.agreement_id.is_none()
        && result.installments.is_empty()
        && result.payment_links.is_empty()
        && result.payment_code.is_none()
    {
        return Err(anyhow!(
            "agreement registration returned no agreement reference: {}",
            result.raw
        ));
    }

    Ok(result)
}

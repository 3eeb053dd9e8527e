use serde::{Deserialize, Deserializer, Serialize};

use crate::connector::{MatchKey, TargetRecord, TypedValue, ValueKind};

/// Envelope every Bitrix24 REST method answers with.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub result: Option<T>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Error part of the envelope, parsed leniently from any response body.
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl ApiErrorBody {
    pub fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    pub fn describe(&self, fallback: &str) -> String {
        match (&self.error, &self.error_description) {
            (Some(code), Some(desc)) if !desc.is_empty() => format!("{code}: {desc}"),
            (Some(code), _) => code.clone(),
            _ => fallback.to_owned(),
        }
    }
}

/// Multi-value entry (`PHONE`, `EMAIL`). An `ID` makes Bitrix overwrite that
/// entry in place; without one the value is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiField {
    #[serde(
        rename = "ID",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_id"
    )]
    pub id: Option<String>,
    #[serde(rename = "VALUE")]
    pub value: String,
    #[serde(rename = "VALUE_TYPE", default)]
    pub value_type: String,
}

impl MultiField {
    fn from_typed(typed: &TypedValue) -> Self {
        Self {
            id: typed.entry_id.clone(),
            value: typed.value.clone(),
            value_type: match typed.kind {
                ValueKind::Work => "WORK".to_owned(),
                ValueKind::Mobile => "MOBILE".to_owned(),
            },
        }
    }

    fn into_typed(self) -> TypedValue {
        let kind = if self.value_type.eq_ignore_ascii_case("MOBILE") {
            ValueKind::Mobile
        } else {
            ValueKind::Work
        };
        TypedValue {
            value: self.value,
            kind,
            entry_id: self.id,
        }
    }
}

/// `crm.contact` fields the sync reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactFields {
    #[serde(
        rename = "ID",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_id"
    )]
    pub id: Option<String>,
    #[serde(rename = "NAME", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "PHONE", default, skip_serializing_if = "Vec::is_empty")]
    pub phone: Vec<MultiField>,
    #[serde(rename = "EMAIL", default, skip_serializing_if = "Vec::is_empty")]
    pub email: Vec<MultiField>,
    #[serde(rename = "COMMENTS", default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(rename = "ADDRESS", default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(rename = "ADDRESS_CITY", default, skip_serializing_if = "Option::is_none")]
    pub address_city: Option<String>,
    #[serde(
        rename = "ADDRESS_POSTAL_CODE",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub address_postal_code: Option<String>,
    #[serde(rename = "ADDRESS_COUNTRY", default, skip_serializing_if = "Option::is_none")]
    pub address_country: Option<String>,
    #[serde(rename = "ORIGINATOR_ID", default, skip_serializing_if = "Option::is_none")]
    pub originator_id: Option<String>,
    #[serde(rename = "ORIGIN_ID", default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
}

impl ContactFields {
    pub fn from_target(record: &TargetRecord) -> Self {
        Self {
            id: None,
            name: record.name.clone(),
            phone: record.phones.iter().map(MultiField::from_typed).collect(),
            email: record.emails.iter().map(MultiField::from_typed).collect(),
            comments: record.note.clone(),
            address: record.address.clone(),
            address_city: record.city.clone(),
            address_postal_code: record.postal_code.clone(),
            address_country: record.country.clone(),
            originator_id: record.match_key.as_ref().map(|k| k.originator.clone()),
            origin_id: record.match_key.as_ref().map(|k| k.external_id.clone()),
        }
    }

    pub fn into_target(self) -> TargetRecord {
        let match_key = match (self.originator_id, self.origin_id) {
            (Some(originator), Some(external_id)) => Some(MatchKey::new(originator, external_id)),
            _ => None,
        };
        TargetRecord {
            remote_id: self.id,
            match_key,
            name: self.name,
            phones: self.phone.into_iter().map(MultiField::into_typed).collect(),
            emails: self.email.into_iter().map(MultiField::into_typed).collect(),
            address: self.address,
            city: self.address_city,
            postal_code: self.address_postal_code,
            country: self.address_country,
            note: self.comments,
        }
    }
}

/// Bitrix returns identifiers as either JSON strings or numbers.
pub fn id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_to_string))
}

//! Raw harvested records and their typed, validated form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::parse::{parse_money, parse_portal_datetime};
use crate::{TenderFields, TenderStatus};

/// Field map produced by a harvesting worker. Keys are documented field names
/// (see [`TenderRecord::from_raw`]); blank values count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(BTreeMap<String, String>);

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First non-blank value among `names`, trimmed.
    pub fn get_any(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.0.get(*name))
            .map(|value| value.trim())
            .find(|value| !value.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record has no portal_tender_uid")]
    MissingUid,
}

/// A validated incoming observation of one tender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderRecord {
    pub portal_tender_uid: String,
    pub fields: TenderFields,
    /// Explicit lifecycle signal scraped from the portal, if any.
    pub status_signal: Option<TenderStatus>,
}

const UID: &[&str] = &["portal_tender_uid", "tender_id", "uid"];
const TITLE: &[&str] = &["title", "tender_title", "work_description"];
const REFERENCE: &[&str] = &["reference_number", "tender_reference", "ref_no"];
const DEPARTMENT: &[&str] = &["department", "department_name"];
const ORG_CHAIN: &[&str] = &["organisation_chain", "organization_chain", "org_chain"];
const PUBLISHED: &[&str] = &["published_at", "published_date", "epublished_date"];
const OPENING: &[&str] = &["opening_at", "opening_date", "bid_opening_date"];
const CLOSING: &[&str] = &["closing_at", "closing_date", "bid_submission_end_date"];
const EMD_TEXT: &[&str] = &["emd_text", "emd"];
const EMD_AMOUNT: &[&str] = &["emd_amount"];
const COST_TEXT: &[&str] = &["estimated_cost_text", "tender_value", "estimated_cost"];
const COST_AMOUNT: &[&str] = &["estimated_cost_amount"];
const TENDER_TYPE: &[&str] = &["tender_type"];
const WORK_TYPE: &[&str] = &["work_type", "tender_category"];
const PAYMENT_TYPE: &[&str] = &["payment_type", "payment_mode"];
const LOCATION: &[&str] = &["location", "work_location"];
const CITY: &[&str] = &["city"];
const DISTRICT: &[&str] = &["district"];
const STATE: &[&str] = &["state"];
const PINCODE: &[&str] = &["pincode", "pin_code"];
const DETAIL_URL: &[&str] = &["detail_url", "tender_url", "url"];
const STATUS: &[&str] = &["status", "tender_status"];

impl TenderRecord {
    /// Validate and type a raw field map.
    ///
    /// Only a missing identity key rejects the record. Money and date text
    /// that fails to parse keeps its raw text where there is a text column
    /// and otherwise stays absent. An unknown status word carries no signal.
    pub fn from_raw(raw: &RawRecord) -> Result<Self, RecordError> {
        let portal_tender_uid = raw.get_any(UID).ok_or(RecordError::MissingUid)?.to_string();
        let text = |names: &[&str]| raw.get_any(names).map(str::to_string);
        let date = |names: &[&str]| raw.get_any(names).and_then(parse_portal_datetime);

        let emd_text = text(EMD_TEXT);
        let emd_amount = raw
            .get_any(EMD_AMOUNT)
            .and_then(parse_money)
            .or_else(|| emd_text.as_deref().and_then(parse_money));
        let estimated_cost_text = text(COST_TEXT);
        let estimated_cost = raw
            .get_any(COST_AMOUNT)
            .and_then(parse_money)
            .or_else(|| estimated_cost_text.as_deref().and_then(parse_money));

        let status_signal = raw.get_any(STATUS).and_then(|text| match text.parse::<TenderStatus>() {
            Ok(status) => Some(status),
            Err(_) => {
                warn!(uid = %portal_tender_uid, status = text, "ignoring unrecognised status signal");
                None
            }
        });

        Ok(Self {
            portal_tender_uid,
            fields: TenderFields {
                title: text(TITLE),
                reference_number: text(REFERENCE),
                department: text(DEPARTMENT),
                organisation_chain: text(ORG_CHAIN),
                published_at: date(PUBLISHED),
                opening_at: date(OPENING),
                closing_at: date(CLOSING),
                emd_text,
                emd_amount,
                estimated_cost_text,
                estimated_cost,
                tender_type: text(TENDER_TYPE),
                work_type: text(WORK_TYPE),
                payment_type: text(PAYMENT_TYPE),
                location: text(LOCATION),
                city: text(CITY),
                district: text(DISTRICT),
                state: text(STATE),
                pincode: text(PINCODE),
                detail_url: text(DETAIL_URL),
            },
            status_signal,
        })
    }
}

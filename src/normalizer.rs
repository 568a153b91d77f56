use std::fmt::Display;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize};

use crate::BlockHeight;

pub const BANK_MSG_SEND: &str = "BankMsgSend";
pub const MSG_ADD_PACKAGE: &str = "MsgAddPackage";
pub const MSG_CALL: &str = "MsgCall";
pub const MSG_RUN: &str = "MsgRun";

/// Transaction as returned by the indexer's `transactions` query.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RawTransaction {
    pub block_height: BlockHeight,
    pub hash: String,
    #[serde(default)]
    pub messages: Vec<RawMessage>,
}

impl RawTransaction {
    /// The message this transaction is displayed as. Every transaction seen so far
    /// carries exactly one.
    pub fn message(&self) -> Option<&MessageVariant> {
        self.messages.first().map(|message| &message.value)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RawMessage {
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default, rename = "typeUrl")]
    pub type_url: Option<String>,
    pub value: MessageVariant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageVariant {
    ValueTransfer(ValueTransfer),
    PackagePublish(PackagePublish),
    FunctionCall(FunctionCall),
    PackageRun(PackageRun),
    /// A message kind this crate doesn't know about. Only the `__typename` is kept.
    Unknown { type_name: String },
    /// A known message kind whose fields didn't parse. Kept so one bad record doesn't fail
    /// the whole batch.
    Malformed { type_name: String, reason: String },
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ValueTransfer {
    pub from_address: String,
    pub to_address: String,
    #[serde(deserialize_with = "deserialize_amount")]
    pub amount: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PackagePublish {
    pub creator: String,
    pub package: RawPackage,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RawPackage {
    #[serde(default)]
    pub name: Option<String>,
    pub path: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub caller: String,
    pub pkg_path: String,
    #[serde(default, deserialize_with = "deserialize_args")]
    pub args: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PackageRun {
    pub caller: String,
    pub package: RawPackage,
}

impl MessageVariant {
    /// The GraphQL `__typename` of this message.
    pub fn tag(&self) -> &str {
        match self {
            MessageVariant::ValueTransfer(_) => BANK_MSG_SEND,
            MessageVariant::PackagePublish(_) => MSG_ADD_PACKAGE,
            MessageVariant::FunctionCall(_) => MSG_CALL,
            MessageVariant::PackageRun(_) => MSG_RUN,
            MessageVariant::Unknown { type_name } | MessageVariant::Malformed { type_name, .. } => {
                type_name
            }
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(
            self,
            MessageVariant::Unknown { .. } | MessageVariant::Malformed { .. }
        )
    }
}

impl<'de> Deserialize<'de> for MessageVariant {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut value = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
        let type_name = match value.remove("__typename") {
            Some(serde_json::Value::String(type_name)) => type_name,
            Some(other) => {
                return Err(D::Error::custom(format!(
                    "__typename must be a string, got {other}"
                )))
            }
            None => return Err(D::Error::missing_field("__typename")),
        };
        let fields = serde_json::Value::Object(value);
        let parsed = match type_name.as_str() {
            BANK_MSG_SEND => serde_json::from_value(fields).map(MessageVariant::ValueTransfer),
            MSG_ADD_PACKAGE => serde_json::from_value(fields).map(MessageVariant::PackagePublish),
            MSG_CALL => serde_json::from_value(fields).map(MessageVariant::FunctionCall),
            MSG_RUN => serde_json::from_value(fields).map(MessageVariant::PackageRun),
            _ => return Ok(MessageVariant::Unknown { type_name }),
        };
        Ok(parsed.unwrap_or_else(|err| MessageVariant::Malformed {
            type_name,
            reason: err.to_string(),
        }))
    }
}

/// Amounts come either as a coin string ("5ugnot") or a bare number.
fn deserialize_amount<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(amount) => Ok(amount),
        serde_json::Value::Number(amount) => Ok(amount.to_string()),
        other => Err(D::Error::custom(format!(
            "amount must be a string or a number, got {other}"
        ))),
    }
}

fn deserialize_args<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTransaction {
    pub block: BlockHeight,
    pub hash: String,
    /// Account that initiated the message. `None` for unknown message kinds.
    pub sender: Option<String>,
    pub extrinsic: Extrinsic,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Extrinsic {
    pub name: String,
    pub value: ExtrinsicValue,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ExtrinsicValue {
    Transfer {
        from: String,
        to: String,
        amount: String,
    },
    Publish {
        creator: String,
        package: PackageRef,
    },
    Call {
        caller: String,
        package: PackageRef,
        args: Vec<String>,
    },
    Run {
        caller: String,
        package: PackageRef,
    },
    Empty {},
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub path: String,
}

impl NormalizedTransaction {
    pub fn is_known(&self) -> bool {
        !matches!(self.extrinsic.value, ExtrinsicValue::Empty {})
    }
}

impl Display for NormalizedTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} by {} in block {} ({})",
            self.extrinsic.name,
            self.sender.as_deref().unwrap_or("<unknown>"),
            self.block,
            self.hash
        )
    }
}

/// Maps a raw transaction to the uniform `{block, hash, sender, extrinsic}` shape.
///
/// Unknown or malformed message kinds (and transactions without messages) don't fail: they
/// get no sender and an empty value, and keep whatever `__typename` they had.
pub fn normalize(raw: &RawTransaction) -> NormalizedTransaction {
    let (sender, name, value) = match raw.message() {
        Some(MessageVariant::ValueTransfer(transfer)) => (
            Some(transfer.from_address.clone()),
            BANK_MSG_SEND,
            ExtrinsicValue::Transfer {
                from: transfer.from_address.clone(),
                to: transfer.to_address.clone(),
                amount: transfer.amount.clone(),
            },
        ),
        Some(MessageVariant::PackagePublish(publish)) => (
            Some(publish.creator.clone()),
            MSG_ADD_PACKAGE,
            ExtrinsicValue::Publish {
                creator: publish.creator.clone(),
                package: PackageRef {
                    name: publish.package.name.clone(),
                    path: publish.package.path.clone(),
                },
            },
        ),
        Some(MessageVariant::FunctionCall(call)) => (
            Some(call.caller.clone()),
            MSG_CALL,
            ExtrinsicValue::Call {
                caller: call.caller.clone(),
                package: PackageRef {
                    name: None,
                    path: call.pkg_path.clone(),
                },
                args: call.args.clone(),
            },
        ),
        Some(MessageVariant::PackageRun(run)) => (
            Some(run.caller.clone()),
            MSG_RUN,
            ExtrinsicValue::Run {
                caller: run.caller.clone(),
                package: PackageRef {
                    name: None,
                    path: run.package.path.clone(),
                },
            },
        ),
        Some(
            MessageVariant::Unknown { type_name } | MessageVariant::Malformed { type_name, .. },
        ) => (None, type_name.as_str(), ExtrinsicValue::Empty {}),
        None => (None, "", ExtrinsicValue::Empty {}),
    };
    NormalizedTransaction {
        block: raw.block_height,
        hash: raw.hash.clone(),
        sender,
        extrinsic: Extrinsic {
            name: name.to_string(),
            value,
        },
    }
}

/// Normalizes a batch as delivered by the indexer (oldest first) and returns it newest first.
pub fn normalize_window(raw: &[RawTransaction]) -> Vec<NormalizedTransaction> {
    raw.iter()
        .rev()
        .map(|transaction| {
            if transaction.messages.len() > 1 {
                log::debug!(target: "gnopoller::normalizer", "Transaction {} has {} messages, only the first one is shown",
                    transaction.hash, transaction.messages.len());
            }
            let normalized = normalize(transaction);
            if let Some(MessageVariant::Malformed { type_name, reason }) = transaction.message() {
                log::warn!(target: "gnopoller::normalizer", "Malformed {type_name} in transaction {} at block {}: {reason}",
                    normalized.hash, normalized.block);
            } else if !normalized.is_known() {
                log::warn!(target: "gnopoller::normalizer", "Unrecognized message type {:?} in transaction {} at block {}",
                    normalized.extrinsic.name, normalized.hash, normalized.block);
            }
            normalized
        })
        .collect()
}

//! Capability boundary to the out-of-process contract executor.
//!
//! The node never runs contract code itself; it asks an executor service for
//! contract metadata and for the outcome of running a call sequence against a
//! previous state. Everything here is the data contract of that boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::{user_fields, Address, Transaction, UserFieldValue};

/// Error codes embedded in new_state return values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ContractErrorCode {
    TimeExpired = 1,
    OutOfFunds = 2,
    StdException = 3,
    Exception = 4,
    UnpayableReplenish = 5,
    ConsensusRejected = 6,
    ExecuteTransaction = 7,
    InternalBug = 8,
    ExecutionError = 9,
}

impl ContractErrorCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::TimeExpired),
            2 => Some(Self::OutOfFunds),
            3 => Some(Self::StdException),
            4 => Some(Self::Exception),
            5 => Some(Self::UnpayableReplenish),
            6 => Some(Self::ConsensusRejected),
            7 => Some(Self::ExecuteTransaction),
            8 => Some(Self::InternalBug),
            9 => Some(Self::ExecutionError),
            _ => None,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::TimeExpired => "timeout during operation",
            Self::OutOfFunds => "insufficient funds to complete operation",
            Self::StdException => "connection error while executing contract",
            Self::Exception => "common error while executing contract",
            Self::UnpayableReplenish => "replenished contract does not implement payable()",
            Self::ConsensusRejected => {
                "the trusted consensus have rejected new_state (or emitted transactions)"
            }
            Self::ExecuteTransaction => "common error in executor",
            Self::InternalBug => "internal bug in node detected",
            Self::ExecutionError => "executor is disconnected or unavailable, or incompatible",
        }
    }
}

pub fn error_message(code: u8) -> String {
    match ContractErrorCode::from_u8(code) {
        Some(known) => known.message().to_string(),
        None => format!("error code {code}"),
    }
}

pub const PAYABLE_NAME: &str = "payable";
pub const USES_CONTRACT_ANNOTATION: &str = "UsesContract";
pub const USES_CONTRACT_ADDRESS_ARG: &str = "address";
pub const USES_CONTRACT_METHOD_ARG: &str = "method";

pub const TYPE_VOID: &str = "void";
pub const TYPE_STRING: &str = "string";
pub const TYPE_BIG_DECIMAL: &str = "bigdecimal";
pub const TYPE_BYTE_ARRAY: &str = "bytes";

/// Whether (and in which flavour) a contract implements `payable`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayableStatus {
    #[default]
    Unknown,
    Absent,
    Implemented,
    ImplementedVer1,
}

impl PayableStatus {
    pub fn implemented(self) -> bool {
        matches!(self, PayableStatus::Implemented | PayableStatus::ImplementedVer1)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteCodeObject {
    pub name: String,
    pub code: Vec<u8>,
}

/// The payload of a deploy or start transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractInvocation {
    /// Empty for a deploy (the constructor runs).
    pub method: String,
    pub params: Vec<String>,
    pub byte_code_objects: Vec<ByteCodeObject>,
    /// Contracts the caller declares it may invoke.
    pub used_contracts: Vec<Address>,
}

impl ContractInvocation {
    pub fn deploy(byte_code_objects: Vec<ByteCodeObject>) -> Self {
        Self {
            byte_code_objects,
            ..Self::default()
        }
    }

    pub fn start(method: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            method: method.into(),
            params,
            ..Self::default()
        }
    }

    pub fn is_deploy(&self) -> bool {
        self.method.is_empty()
    }

    pub fn to_user_field(&self) -> ChainResult<UserFieldValue> {
        Ok(UserFieldValue::Bytes(bincode::serialize(self)?))
    }

    pub fn from_user_field(field: &UserFieldValue) -> ChainResult<Self> {
        let bytes = field
            .as_bytes()
            .ok_or_else(|| ChainError::Codec("invocation field is not bytes".into()))?;
        Ok(bincode::deserialize(bytes)?)
    }

    /// Decodes the invocation carried by a deploy/start transaction.
    pub fn from_transaction(transaction: &Transaction) -> Option<Self> {
        transaction
            .user_field(user_fields::CODE)
            .and_then(|field| Self::from_user_field(field).ok())
    }

    pub fn concatenated_bytecode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for object in &self.byte_code_objects {
            bytes.extend_from_slice(&object.code);
        }
        bytes
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodArgument {
    pub name: String,
    pub type_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodAnnotation {
    pub name: String,
    pub arguments: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescription {
    pub name: String,
    pub return_type: String,
    pub arguments: Vec<MethodArgument>,
    pub annotations: Vec<MethodAnnotation>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractMethods {
    pub methods: Vec<MethodDescription>,
}

impl ContractMethods {
    /// Derives the payable flavour from the method table: the legacy form is
    /// `void payable(string, string)`, version 1 is
    /// `string payable(bigdecimal, bytes)`.
    pub fn payable_status(&self) -> PayableStatus {
        let mut status = PayableStatus::Absent;
        for method in &self.methods {
            if status == PayableStatus::ImplementedVer1 || method.name != PAYABLE_NAME {
                continue;
            }
            if method.arguments.len() != 2 {
                continue;
            }
            let (a0, a1) = (&method.arguments[0], &method.arguments[1]);
            if method.return_type == TYPE_VOID
                && a0.type_name == TYPE_STRING
                && a1.type_name == TYPE_STRING
            {
                status = PayableStatus::Implemented;
            } else if method.return_type == TYPE_STRING
                && a0.type_name == TYPE_BIG_DECIMAL
                && a1.type_name == TYPE_BYTE_ARRAY
            {
                status = PayableStatus::ImplementedVer1;
            }
        }
        status
    }

    /// Declared subcalls of a method: `@UsesContract(address, method)`
    /// annotations, keyed by the annotated method's name.
    pub fn uses(&self) -> BTreeMap<String, Vec<(Address, String)>> {
        let mut uses: BTreeMap<String, Vec<(Address, String)>> = BTreeMap::new();
        for method in &self.methods {
            for annotation in &method.annotations {
                if annotation.name != USES_CONTRACT_ANNOTATION {
                    continue;
                }
                let Some(address_hex) = annotation.arguments.get(USES_CONTRACT_ADDRESS_ARG) else {
                    continue;
                };
                let Ok(key) = crate::crypto::public_key_from_hex(address_hex) else {
                    continue;
                };
                let subcall_method = annotation
                    .arguments
                    .get(USES_CONTRACT_METHOD_ARG)
                    .cloned()
                    .unwrap_or_default();
                uses.entry(method.name.clone())
                    .or_default()
                    .push((Address::Key(key), subcall_method));
            }
        }
        uses
    }
}

/// Return value of an executed method, serialized into the new_state
/// transaction's `RET_VAL` user field.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnValue {
    #[default]
    Void,
    Byte(u8),
    Integer(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ReturnValue {
    pub fn error(code: ContractErrorCode) -> Self {
        ReturnValue::Byte(code as u8)
    }

    pub fn to_user_field(&self) -> ChainResult<UserFieldValue> {
        Ok(UserFieldValue::Bytes(bincode::serialize(self)?))
    }

    pub fn from_user_field(field: &UserFieldValue) -> ChainResult<Self> {
        let bytes = field
            .as_bytes()
            .ok_or_else(|| ChainError::Codec("return value field is not bytes".into()))?;
        Ok(bincode::deserialize(bytes)?)
    }
}

/// How the executor resolves the method to invoke.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MethodNameConvention {
    #[default]
    Default,
    PayableLegacy,
    Payable,
}

#[derive(Clone, Debug)]
pub struct ExecuteRequest {
    pub transaction: Transaction,
    pub invocation: ContractInvocation,
    /// State the call runs against; in a multi-call this is the previous
    /// call's fresh state rather than the committed one.
    pub contract_state: Vec<u8>,
    pub convention: MethodNameConvention,
    pub fee_limit: u64,
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionOutcome {
    pub new_state: Vec<u8>,
    pub ret_value: ReturnValue,
    /// Transactions the contract emitted while running.
    pub emitted: Vec<Transaction>,
    /// Fresh states of subcalled contracts.
    pub subsequent_states: BTreeMap<Address, Vec<u8>>,
    pub execution_cost: u64,
}

/// The remote executor capability.
pub trait ContractExecutor: Send + Sync {
    fn contract_methods(&self, byte_code: &[ByteCodeObject]) -> ChainResult<ContractMethods>;
    fn execute(&self, request: ExecuteRequest) -> ChainResult<ExecutionOutcome>;
    fn is_connected(&self) -> bool;
}

/// Stands in while no executor service is wired up; every call fails and the
/// scheduler falls back to its disconnected-executor behaviour.
pub struct OfflineExecutor;

impl ContractExecutor for OfflineExecutor {
    fn contract_methods(&self, _byte_code: &[ByteCodeObject]) -> ChainResult<ContractMethods> {
        Err(ChainError::Contract("executor is not connected".into()))
    }

    fn execute(&self, _request: ExecuteRequest) -> ChainResult<ExecutionOutcome> {
        Err(ChainError::Contract("executor is not connected".into()))
    }

    fn is_connected(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_user_field_roundtrip() {
        let invocation = ContractInvocation {
            method: "transfer".into(),
            params: vec!["42".into()],
            byte_code_objects: vec![ByteCodeObject {
                name: "Main".into(),
                code: vec![1, 2, 3],
            }],
            used_contracts: vec![Address::Key([5u8; 32])],
        };
        let field = invocation.to_user_field().expect("encode invocation");
        let decoded = ContractInvocation::from_user_field(&field).expect("decode invocation");
        assert_eq!(decoded, invocation);
        assert!(!decoded.is_deploy());
    }

    #[test]
    fn payable_status_detection() {
        let legacy = ContractMethods {
            methods: vec![MethodDescription {
                name: PAYABLE_NAME.into(),
                return_type: TYPE_VOID.into(),
                arguments: vec![
                    MethodArgument {
                        name: "amount".into(),
                        type_name: TYPE_STRING.into(),
                    },
                    MethodArgument {
                        name: "currency".into(),
                        type_name: TYPE_STRING.into(),
                    },
                ],
                annotations: Vec::new(),
            }],
        };
        assert_eq!(legacy.payable_status(), PayableStatus::Implemented);

        let absent = ContractMethods {
            methods: vec![MethodDescription {
                name: "transfer".into(),
                ..MethodDescription::default()
            }],
        };
        assert_eq!(absent.payable_status(), PayableStatus::Absent);
    }

    #[test]
    fn uses_annotations_are_collected_per_method() {
        let address = [3u8; 32];
        let methods = ContractMethods {
            methods: vec![MethodDescription {
                name: "swap".into(),
                annotations: vec![MethodAnnotation {
                    name: USES_CONTRACT_ANNOTATION.into(),
                    arguments: [
                        (USES_CONTRACT_ADDRESS_ARG.to_string(), hex::encode(address)),
                        (USES_CONTRACT_METHOD_ARG.to_string(), "deposit".to_string()),
                    ]
                    .into_iter()
                    .collect(),
                }],
                ..MethodDescription::default()
            }],
        };
        let uses = methods.uses();
        assert_eq!(
            uses.get("swap"),
            Some(&vec![(Address::Key(address), "deposit".to_string())])
        );
    }
}

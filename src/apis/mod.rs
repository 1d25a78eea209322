pub mod claim_types;
pub mod cloudaccount_types;
pub mod conditions;
pub mod federated_types;
pub mod pool_types;

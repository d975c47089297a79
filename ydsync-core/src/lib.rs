mod client;

pub use client::{
    ApiErrorClass, Completion, DiskInfo, FilePage, OperationStatus, RESOURCE_FIELDS, Resource,
    ResourceType, TransferLink, YadiskClient, YadiskError,
};

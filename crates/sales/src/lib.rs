//! Sales documents domain module.
//!
//! A finalized sales document records which batches fulfilled each of its
//! lines. This crate holds the document state machine and the per-product
//! diff used when a document's lines change. Pure domain logic (no IO).

pub mod diff;
pub mod document;

pub use diff::{LineDiff, RetainedAllocation, diff_lines};
pub use document::{
    CustomerId, EmployeeId, SaleLine, SalesAllocationLine, SalesDocument, SalesDocumentId,
    SalesDocumentStatus, SalesRequest,
};

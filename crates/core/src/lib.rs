pub mod config;
pub mod decision;
pub mod diagnostics;
pub mod domain;
pub mod errors;
pub mod plan;
pub mod trace;

pub use decision::{
    DecisionType, DecodeFailure, DecodeStrategy, DecodedResponse, FieldValidationError,
    ResponseDecoder,
};
pub use diagnostics::{
    DiagnosticCategory, DiagnosticEvent, DiagnosticSink, InMemoryDiagnosticSink,
    NoopDiagnosticSink, TracingDiagnosticSink,
};
pub use domain::appointment::{Appointment, AppointmentId, AppointmentStatus, Slot, SlotId};
pub use domain::customer::{AccountStatus, Customer, CustomerId, Eligibility, LoyaltyTier};
pub use domain::interaction::InteractionRecord;
pub use domain::ticket::{EscalationTicket, TicketId, TicketPriority};
pub use errors::{ApplicationError, InterfaceError};
pub use plan::{
    output_fact_key, Binding, Expectation, Facts, Fallback, OutputRef, PathSegment, Plan,
    PlanBuilder, PlanCompletion, PlanConstructionError, Step, ToolOutput,
};
pub use trace::{ExecutionTrace, TraceEntry, TraceEntryKind};

//! The per-connection session state machine.
//!
//! One authoritative state per connection. Decoded backend messages and
//! command-sent markers arrive as [`Event`]s; [`SessionState::apply`] is the
//! pure transition table and returns `None` for events a state ignores.
//! Entry side effects (failing the in-flight waiter, finishing the previous
//! operation, draining the queue, sending `Sync`) live in the engine.

/// Session states. `Startup` is initial; the startup packet is sent on
/// connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Startup,
    Authorizing,
    ReceiveServerData,
    Ready,
    QueryInProgress,
    RowsetQueryInProgress,
    EmptyQueryInProgress,
    ParseInProgress,
    BindInProgress,
    StatementDescribeInProgress,
    PortalDescribeInProgress,
    ExecuteInProgress,
    ClosePortalInProgress,
    CloseStatementInProgress,
    Syncing,
    QueryFailed,
    ParseFailed,
    BindFailed,
    ExecuteFailed,
    ClosePortalFailed,
    CloseStatementFailed,
    ConnectionFailed,
    UnsupportedAuthMethod,
}

/// Events driving the session machine: one per backend message consumed
/// plus one per frontend command sent, and the internal `ErrorReset` fired
/// after a parse or bind failure is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password,
    AuthenticationUnsupported,
    BackendKeyData,
    ParameterStatus,
    NoticeResponse,
    ReadyForQuery,
    QuerySent,
    ParseSent,
    BindSent,
    DescribeStatementSent,
    DescribePortalSent,
    ExecuteSent,
    ClosePortalSent,
    CloseStatementSent,
    ParseComplete,
    BindComplete,
    CloseComplete,
    ParameterDescription,
    RowDescription,
    DataRow,
    NoData,
    PortalSuspended,
    EmptyQueryResponse,
    CommandComplete,
    ErrorResponse,
    ErrorReset,
}

use self::{Event as E, SessionState as S};

impl SessionState {
    /// The transition table. `None` means the event is ignored in this
    /// state and the state is kept.
    pub fn apply(self, event: Event) -> Option<SessionState> {
        Some(match (self, event) {
            (S::Startup | S::Authorizing, E::AuthenticationOk) => S::ReceiveServerData,
            (S::Startup, E::AuthenticationCleartextPassword) => S::Authorizing,
            (S::Startup, E::AuthenticationMd5Password) => S::Authorizing,
            (S::Startup, E::AuthenticationUnsupported) => S::UnsupportedAuthMethod,

            (S::ReceiveServerData, E::BackendKeyData | E::ParameterStatus) => self,

            (_, E::NoticeResponse) => self,

            (
                S::ReceiveServerData
                | S::QueryInProgress
                | S::RowsetQueryInProgress
                | S::EmptyQueryInProgress
                | S::QueryFailed
                | S::Syncing
                | S::ExecuteFailed
                | S::ClosePortalFailed
                | S::CloseStatementFailed,
                E::ReadyForQuery,
            ) => S::Ready,

            (S::Ready, E::QuerySent) => S::QueryInProgress,
            (S::Ready, E::ParseSent) => S::ParseInProgress,
            (S::Ready, E::BindSent) => S::BindInProgress,
            (S::Ready, E::DescribeStatementSent) => S::StatementDescribeInProgress,
            (S::Ready, E::DescribePortalSent) => S::PortalDescribeInProgress,
            (S::Ready, E::ExecuteSent) => S::ExecuteInProgress,
            (S::Ready, E::ClosePortalSent) => S::ClosePortalInProgress,
            (S::Ready, E::CloseStatementSent) => S::CloseStatementInProgress,

            (S::ParseInProgress, E::ParseComplete) => S::Ready,
            (S::BindInProgress, E::BindComplete) => S::Ready,
            (S::ClosePortalInProgress | S::CloseStatementInProgress, E::CloseComplete) => S::Ready,

            (S::StatementDescribeInProgress, E::ParameterDescription) => self,
            (
                S::StatementDescribeInProgress | S::PortalDescribeInProgress,
                E::RowDescription | E::NoData,
            ) => S::Ready,

            (
                S::QueryInProgress | S::RowsetQueryInProgress,
                E::RowDescription | E::DataRow,
            ) => S::RowsetQueryInProgress,
            (S::ExecuteInProgress, E::DataRow) => self,
            // a suspended portal ends the execute step; resuming it takes
            // another Execute submission
            (S::ExecuteInProgress, E::PortalSuspended) => S::Ready,

            (S::QueryInProgress, E::EmptyQueryResponse) => S::EmptyQueryInProgress,
            (S::ExecuteInProgress, E::EmptyQueryResponse) => S::Ready,

            // next command of a simple-query batch
            (
                S::QueryInProgress | S::RowsetQueryInProgress | S::EmptyQueryInProgress,
                E::CommandComplete,
            ) => S::QueryInProgress,
            (S::ExecuteInProgress, E::CommandComplete) => S::Ready,

            (S::Startup | S::Authorizing | S::ReceiveServerData, E::ErrorResponse) => {
                S::ConnectionFailed
            }
            (
                S::QueryInProgress | S::RowsetQueryInProgress | S::EmptyQueryInProgress,
                E::ErrorResponse,
            ) => S::QueryFailed,
            (S::ParseInProgress, E::ErrorResponse) => S::ParseFailed,
            (S::BindInProgress, E::ErrorResponse) => S::BindFailed,
            (
                S::StatementDescribeInProgress | S::PortalDescribeInProgress,
                E::ErrorResponse,
            ) => S::ParseFailed,
            (S::ExecuteInProgress, E::ErrorResponse) => S::ExecuteFailed,
            (S::ClosePortalInProgress, E::ErrorResponse) => S::ClosePortalFailed,
            (S::CloseStatementInProgress, E::ErrorResponse) => S::CloseStatementFailed,

            (S::ParseFailed | S::BindFailed, E::ErrorReset) => S::Syncing,

            _ => return None,
        })
    }

    /// Whether an operation is currently in flight.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            S::QueryInProgress
                | S::RowsetQueryInProgress
                | S::EmptyQueryInProgress
                | S::ParseInProgress
                | S::BindInProgress
                | S::StatementDescribeInProgress
                | S::PortalDescribeInProgress
                | S::ExecuteInProgress
                | S::ClosePortalInProgress
                | S::CloseStatementInProgress
        )
    }

    /// Whether the connection is beyond recovery.
    pub fn is_terminal(self) -> bool {
        matches!(self, S::ConnectionFailed | S::UnsupportedAuthMethod)
    }
}

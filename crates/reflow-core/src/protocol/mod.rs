//! Wire protocol for client-server communication.

pub mod back;
pub mod forward;
pub mod page;

pub use back::{
    BackMsg, BackMsgKind, ClientState, FileUrlsRequest, WidgetState, WidgetStates, WidgetValue,
};
pub use forward::{
    AppPage, Delta, DeltaKind, ExceptionInfo, FileUrls, FileUrlsResponse, ForwardMsg,
    ForwardMsgKind, ForwardMsgMetadata, Initialize, NewSession, NewSessionConfig,
    ScriptFinishedStatus, SessionEventKind, SessionStatus,
};
pub use page::PageInfo;

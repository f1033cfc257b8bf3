pub mod collab;
pub mod convert;
pub mod delete;
pub mod discover;
pub mod doctor;
pub mod ledger;
pub mod lock;
pub mod model;
pub mod operator;
pub mod space;

pub use collab::{
    check_tools, DcrawDecoder, DecodeError, DecodeOptions, ExiftoolTransfer, MetadataError,
    MetadataReport, MetadataTransfer, RawDecoder, ToolStatus, METADATA_WARNING_TARGET,
};
pub use convert::{output_path_for, ConvertOptions, Converter, RunContext};
pub use delete::{
    build_deletion_plan, run_deletion, DeleteOptions, DeletionCandidate, DeletionPlan,
    DirectoryGroup, ExcludedEntry, ExclusionReason,
};
pub use discover::{Discoverer, DiscoverySurvey};
pub use doctor::{collect_doctor_info, DoctorInfo};
pub use ledger::{DeletionLedger, Ledger, LedgerError};
pub use lock::{DirectoryLock, LockError, LOCK_FILE_NAME};
pub use model::{
    ConversionEntry, ConversionSummary, CorruptEntry, DeletionEntry, DeletionSummary, ErrorKind,
    ProgressEvent, RawFileRecord, RunOutcome, Severity, CONVERSION_LOG_NAME,
    CONVERSION_RUN_LOG_NAME, CORRUPT_LOG_NAME, DELETION_LOG_NAME, DELETION_RUN_LOG_NAME,
};
pub use operator::{Operator, PauseDecision, ScriptedOperator};
pub use space::{
    PauseContext, PreflightError, SpaceConfig, SpaceMonitor, SpaceProbe, SysinfoSpaceProbe,
    DEFAULT_REQUIRED_BYTES,
};

mod output;
mod supervisor;
mod transcoder;

pub use output::prepare_output_dir;
pub use supervisor::{SessionSupervisor, StartupHandle, SupervisorDeps, SupervisorOptions};
pub use transcoder::{
    spawn_monitored, DiagnosticTail, FfmpegTranscoder, ProcessControl, TranscodeEvent,
    TranscodeJob, TranscodeProcess, TranscodeProgress, Transcoder,
};

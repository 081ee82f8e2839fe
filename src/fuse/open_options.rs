use bitflags::bitflags;

// Flags used by the OPEN reply.
/// The file is not seekable.
const FOPEN_NONSEEKABLE: u32 = 4;

bitflags! {
    /// Flags returned to the kernel in response to an open or create request.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenOptions: u32 {
        /// Object streams are strictly sequential.
        const NONSEEKABLE = FOPEN_NONSEEKABLE;
    }
}

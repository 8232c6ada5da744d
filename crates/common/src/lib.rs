// docsync-common: wire protocol shared by the docsync server and its clients

pub mod name;
pub mod protocol;

mod client;

pub use client::{
    DEFAULT_BASE_URL, File, FileList, FileListPage, PutioClient, PutioError, ROOT_FOLDER_ID,
};

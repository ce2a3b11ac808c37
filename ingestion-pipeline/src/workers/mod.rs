pub mod pdf_worker;
pub mod url_worker;

pub use pdf_worker::PdfWorker;
pub use url_worker::UrlWorker;

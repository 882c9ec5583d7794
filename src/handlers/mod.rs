pub mod cgi;

pub use cgi::{ CgiContext, CgiError, CgiHandler, ProcessCgi };

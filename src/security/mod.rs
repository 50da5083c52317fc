mod cert;

pub use cert::{create_tls_pair_for_test, CertError, CertInfo};

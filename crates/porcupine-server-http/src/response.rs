//! Canned responses written by the router itself

const NOT_FOUND_PAGE: &str = "<html>\r\n\
<head><title>404 Not Found</title></head>\r\n\
<body>\r\n\
<center><h1>404 Not Found</h1></center>\r\n\
<hr><center>Porcupine Tunnel Server</center>\r\n\
</body>\r\n\
</html>\r\n";

fn build(status: &str, content_type: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
    .into_bytes()
}

/// No tunnel for the requested host
pub fn not_found() -> Vec<u8> {
    build("404 Not Found", "text/html", NOT_FOUND_PAGE)
}

/// Tunnel exists but its client could not be reached
pub fn bad_gateway() -> Vec<u8> {
    build("502 Bad Gateway", "text/plain", "Bad Gateway")
}

/// Host header names a different hostname than the TLS session
pub fn misdirected() -> Vec<u8> {
    build("421 Misdirected Request", "text/plain", "Misdirected Request")
}

pub fn bad_request() -> Vec<u8> {
    build("400 Bad Request", "text/plain", "Bad Request")
}

pub fn request_header_too_large() -> Vec<u8> {
    build(
        "431 Request Header Fields Too Large",
        "text/plain",
        "Request Header Fields Too Large",
    )
}

/// ACME HTTP-01 key authorization
pub fn challenge(key_authorization: &str) -> Vec<u8> {
    build("200 OK", "text/plain", key_authorization)
}

pub fn challenge_not_found() -> Vec<u8> {
    build("404 Not Found", "text/plain", "Not Found")
}

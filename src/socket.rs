// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Socket option helpers the transport needs but mio does not expose.

use std::io;

use mio::net::TcpStream;

/// Enables TCP keepalive on a connected socket so dead peers are noticed
/// even on otherwise idle connections.
#[cfg(unix)]
pub(crate) fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    use std::mem::size_of;
    use std::os::unix::io::AsRawFd;

    let enable: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &enable as *const libc::c_int as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn set_keepalive(_stream: &TcpStream) -> io::Result<()> {
    Ok(())
}

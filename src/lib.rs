/*!

A host-side link library for CASIO graphing calculators.

Calculators from the fx-7000G era onwards talk a pair of framed wire
protocols: the byte-oriented legacy family ("CASIOLINK", in its CAS40,
CAS50 and CAS100 flavours) and the ASCII-framed Protocol 7.00 ("Seven"),
which also has a one-way screen-streaming mode. This crate drives both
families over serial lines, USB bulk pipes and USB Mass-Storage devices,
and exposes the transfers they carry: file exchange with overwrite
arbitration, storage listing and maintenance, ROM backup, program upload,
system flashing and screen capture.

```no_run
use calclink::{Link, OpenFlags};

# fn main() -> calclink::Result<()> {
let mut link = Link::open_usb_simple(OpenFlags::empty())?;
let info = link.device_info()?;
println!("connected to {} (OS {})", info.product_id, info.os_version);

let mut file = Vec::new();
link.request_file_from_storage(None, "PYTHON.py", "fls0", &mut file, None)?;
link.close()?;
# Ok(())
# }
```

Logging goes through [`tracing`]; no subscriber is installed by the
crate.

*/

mod casiolink;
mod error;
mod link;
mod medium;
mod params;
mod screen;
mod seven;
mod stream;
mod time;

pub use crate::error::{Error, Result};
pub use crate::link::{DeviceInfo, FlashFlags, Link, SendFileFlags, StorageEntry};
pub use crate::params::{
    CasVariant, LineMode, OpenFlags, Parity, SerialParams, SerialProtocol, StopBits,
};
pub use crate::screen::{Frame, PictureFormat};

use anyhow::bail;

macro_rules! try_read_impl {
    ($try_reader: ident, $ty:ty, $getter: ident) => {
        fn $try_reader(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                bail!("buffer underflow reading {}: {} bytes remaining", stringify!($ty), self.remaining());
            }
            Ok(self.$getter())
        }
    }
}

/// Checked big-endian reads for parsing data received from the network, which may be truncated
///  or malformed.
pub trait BufExt: bytes::Buf {
    try_read_impl!(try_read_u8, u8, get_u8);
    try_read_impl!(try_read_u16, u16, get_u16);
    try_read_impl!(try_read_u32, u32, get_u32);
    try_read_impl!(try_read_f64, f64, get_f64);
}

impl <T: bytes::Buf> BufExt for T {
}

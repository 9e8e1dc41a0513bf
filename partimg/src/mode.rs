//! Permission strings, in the `ls -l` form and as four octal digits

use crate::error::PartimgError;

pub const S_IFMT: u16 = 0o170000;
pub const S_IFSOCK: u16 = 0o140000;
pub const S_IFLNK: u16 = 0o120000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFIFO: u16 = 0o010000;

const S_ISUID: u16 = 0o4000;
const S_ISGID: u16 = 0o2000;
const S_ISVTX: u16 = 0o1000;

/// Render an inode mode as the 10 character `ls -l` string, e.g. `drwxr-xr-x`
pub fn render_mode(mode: u16) -> String {
    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        S_IFCHR => 'c',
        S_IFBLK => 'b',
        S_IFIFO => 'p',
        S_IFSOCK => 's',
        _ => '-',
    };

    let mut s = String::with_capacity(10);
    s.push(kind);
    for (shift, special, set, unset) in
        [(6, S_ISUID, 's', 'S'), (3, S_ISGID, 's', 'S'), (0, S_ISVTX, 't', 'T')]
    {
        let bits = (mode >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        let exec = bits & 0o1 != 0;
        s.push(match (mode & special != 0, exec) {
            (true, true) => set,
            (true, false) => unset,
            (false, true) => 'x',
            (false, false) => '-',
        });
    }
    s
}

/// Decode a permission string into "special owner group other" octal digits
///
/// Accepts the 9 character triplet form or the 10 character form with a leading type
/// character. `s`/`t` set both the special bit and the execute bit of their class, `S`/`T`
/// set only the special bit.
pub fn decode_mode(perms: &str) -> Result<String, PartimgError> {
    let chars: Vec<char> = perms.chars().collect();
    let triplets = match chars.len() {
        9 => &chars[..],
        10 => &chars[1..],
        _ => return Err(PartimgError::Data(format!("invalid permission string {perms:?}"))),
    };

    let mut special = 0;
    let mut digits = [0_u8; 3];
    for (class, triplet) in triplets.chunks(3).enumerate() {
        let (special_bit, special_char) = match class {
            0 => (4, 's'),
            1 => (2, 's'),
            _ => (1, 't'),
        };
        for (pos, c) in triplet.iter().enumerate() {
            match (pos, *c) {
                (0, 'r') => digits[class] += 4,
                (1, 'w') => digits[class] += 2,
                (2, 'x') => digits[class] += 1,
                (2, c) if c == special_char => {
                    special += special_bit;
                    digits[class] += 1;
                }
                (2, c) if c == special_char.to_ascii_uppercase() => special += special_bit,
                (_, '-') => {}
                _ => {
                    return Err(PartimgError::Data(format!("invalid permission string {perms:?}")))
                }
            }
        }
    }

    Ok(format!("{special}{}{}{}", digits[0], digits[1], digits[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode() {
        assert_eq!(decode_mode("-rwxr-xr-x").unwrap(), "0755");
        assert_eq!(decode_mode("-rwsr-xr-x").unwrap(), "4755");
        assert_eq!(decode_mode("-rwxr-sr-x").unwrap(), "2755");
        assert_eq!(decode_mode("-rwxr-xr-t").unwrap(), "1755");
        assert_eq!(decode_mode("drwxr-xr-x").unwrap(), "0755");
        assert_eq!(decode_mode("rw-r--r--").unwrap(), "0644");
        assert_eq!(decode_mode("lrwxrwxrwx").unwrap(), "0777");
    }

    #[test]
    fn decode_uppercase_special() {
        // uppercase sets the special digit only, the execute bit stays clear
        assert_eq!(decode_mode("-rwxr-xr-T").unwrap(), "1754");
        assert_eq!(decode_mode("-rwSr--r--").unwrap(), "4644");
        assert_eq!(decode_mode("-rwxr-Sr--").unwrap(), "2744");
    }

    #[test]
    fn decode_invalid() {
        assert!(decode_mode("").is_err());
        assert!(decode_mode("-rwxr-xr").is_err());
        assert!(decode_mode("-rwxq-xr-x").is_err());
        assert!(decode_mode("-rwxr-xr-s").is_err());
    }

    #[test]
    fn render() {
        assert_eq!(render_mode(S_IFDIR | 0o755), "drwxr-xr-x");
        assert_eq!(render_mode(S_IFREG | 0o644), "-rw-r--r--");
        assert_eq!(render_mode(S_IFLNK | 0o777), "lrwxrwxrwx");
        assert_eq!(render_mode(S_IFREG | 0o4755), "-rwsr-xr-x");
        assert_eq!(render_mode(S_IFREG | 0o2755), "-rwxr-sr-x");
        assert_eq!(render_mode(S_IFDIR | 0o1754), "drwxr-xr-T");
    }

    #[test]
    fn render_then_decode() {
        for mode in [0o755, 0o644, 0o4755, 0o2750, 0o1777, 0o600, 0o6711] {
            let s = render_mode(S_IFREG | mode);
            assert_eq!(decode_mode(&s).unwrap(), format!("{mode:04o}"));
        }
    }
}

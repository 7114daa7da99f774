//! Announce tokens: a lightweight proof that a peer recently ran a `get_peers` query against
//! this node before it's allowed to `announce_peer`.
//!
//! A token is `sha1(secret || ip)`. Two secrets are kept live at once — "current" and
//! "previous" — and rotated on a timer; a token verifies if it matches either one, which gives
//! every issued token a lifetime of one to two rotation periods without this node needing to
//! remember who it handed tokens to.

use crate::common::*;
use rand::RngCore;
use sha1::Sha1;

/// Default for how often the current secret is rotated into "previous" and a new one drawn.
pub const DEFAULT_ROTATION_PERIOD: Duration = Duration::from_secs(5 * 60);

const SECRET_LEN: usize = 20;

struct Secrets {
  current: [u8; SECRET_LEN],
  previous: [u8; SECRET_LEN],
}

fn random_secret() -> [u8; SECRET_LEN] {
  let mut bytes = [0u8; SECRET_LEN];
  rand::rngs::OsRng.fill_bytes(&mut bytes);
  bytes
}

fn digest(secret: &[u8; SECRET_LEN], ip: &Ipv4Addr) -> Vec<u8> {
  let mut hasher = Sha1::new();
  hasher.update(secret);
  hasher.update(&ip.octets());
  hasher.digest().bytes().to_vec()
}

/// Issues and verifies announce tokens, rotating its secret on a background timer.
pub struct TokenManager {
  secrets: Mutex<Secrets>,
  rotation_period: Duration,
}

impl TokenManager {
  pub fn new() -> Arc<Self> {
    Self::with_rotation_period(DEFAULT_ROTATION_PERIOD)
  }

  pub fn with_rotation_period(rotation_period: Duration) -> Arc<Self> {
    Arc::new(TokenManager {
      secrets: Mutex::new(Secrets {
        current: random_secret(),
        previous: random_secret(),
      }),
      rotation_period,
    })
  }

  pub fn generate(&self, ip: &Ipv4Addr) -> Vec<u8> {
    let secrets = self.secrets.lock().unwrap();
    digest(&secrets.current, ip)
  }

  pub fn verify(&self, ip: &Ipv4Addr, token: &[u8]) -> bool {
    let secrets = self.secrets.lock().unwrap();
    token == digest(&secrets.current, ip).as_slice() || token == digest(&secrets.previous, ip).as_slice()
  }

  fn rotate(&self) {
    let mut secrets = self.secrets.lock().unwrap();
    secrets.previous = secrets.current;
    secrets.current = random_secret();
    debug!("rotated announce token secret");
  }

  /// Spawns the rotation thread. The returned handle is detached: the thread runs for the life
  /// of the process and there's nothing meaningful to join on shutdown.
  pub fn spawn_rotation(self: &Arc<Self>) {
    let manager = Arc::clone(self);
    thread::spawn(move || loop {
      thread::sleep(manager.rotation_period);
      manager.rotate();
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ip() -> Ipv4Addr {
    Ipv4Addr::new(203, 0, 113, 7)
  }

  #[test]
  fn a_freshly_generated_token_verifies() {
    let manager = TokenManager::new();
    let token = manager.generate(&ip());
    assert!(manager.verify(&ip(), &token));
  }

  #[test]
  fn a_token_for_one_ip_does_not_verify_for_another() {
    let manager = TokenManager::new();
    let token = manager.generate(&ip());
    assert!(!manager.verify(&Ipv4Addr::new(198, 51, 100, 1), &token));
  }

  #[test]
  fn a_token_survives_one_rotation() {
    let manager = TokenManager::new();
    let token = manager.generate(&ip());
    manager.rotate();
    assert!(manager.verify(&ip(), &token));
  }

  #[test]
  fn a_token_does_not_survive_two_rotations() {
    let manager = TokenManager::new();
    let token = manager.generate(&ip());
    manager.rotate();
    manager.rotate();
    assert!(!manager.verify(&ip(), &token));
  }
}

//! Typed commands and closed command sets.
//!
//! A command set is an ordered, compile-time list of command types declared
//! with [`command_set!`]. The wire id of a member is its position in the
//! declaration, computed at const-eval time; referring to a command that is
//! not in the set fails the build. The ordered name list doubles as the
//! connection fingerprint (see [`crate::handshake`]).

use strata_core::archive::{Load, Save};
use strata_core::wire::CommandId;

/// A single command: its payload is `self`, its reply is `Response`.
///
/// `NAME` is the stable wire name used in the fingerprint; it must never
/// change for a deployed command.
pub trait Command: Save + Load + Send + 'static {
    type Response: Save + Load + Send + 'static;
    const NAME: &'static str;
}

/// An ordered, closed set of commands for one protocol role.
pub trait CommandSet {
    /// Command names in declaration order: the fingerprint.
    const NAMES: &'static [&'static str];
}

/// Membership of command `C` in a set, carrying its stable wire id.
pub trait Member<C: Command>: CommandSet {
    const ID: CommandId;
}

/// Const string equality, used to resolve command positions at build time.
pub const fn str_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        if a[i] != b[i] {
            return false;
        }
        i += 1;
    }
    true
}

/// Position of `target` in `names`. Fails the build when the name is absent,
/// which is exactly what should happen to a command outside its set.
pub const fn position(names: &'static [&'static str], target: &str) -> CommandId {
    let mut i = 0;
    while i < names.len() {
        if str_eq(names[i], target) {
            return i as CommandId;
        }
        i += 1;
    }
    panic!("command name is not a member of the command set");
}

/// Declare a command set: an ordered enum over command types.
///
/// ```ignore
/// command_set! {
///     /// Commands of the block-device meta-data provider.
///     pub enum BlockCommands {
///         BlockSize(BlockSize),
///         Add(Add),
///     }
/// }
/// ```
///
/// Generates the tagged union, [`CommandSet`] (names in declaration order),
/// [`Member`] with the positional id per member, and
/// [`crate::server::Dispatch`] for any handler implementing
/// [`crate::server::Handle`] for every member.
#[macro_export]
macro_rules! command_set {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident($cmd:ty)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug)]
        $vis enum $name {
            $($variant($cmd)),+
        }

        impl $crate::command::CommandSet for $name {
            const NAMES: &'static [&'static str] =
                &[$(<$cmd as $crate::command::Command>::NAME),+];
        }

        $(
            impl $crate::command::Member<$cmd> for $name {
                const ID: strata_core::wire::CommandId = $crate::command::position(
                    <$name as $crate::command::CommandSet>::NAMES,
                    <$cmd as $crate::command::Command>::NAME,
                );
            }
        )+

        impl<H> $crate::server::Dispatch<H> for $name
        where
            H: $($crate::server::Handle<$cmd> +)+ Send + Sync,
        {
            fn decode(
                command_id: strata_core::wire::CommandId,
                payload: &[u8],
            ) -> Result<Self, $crate::server::DispatchError> {
                let mut next: strata_core::wire::CommandId = 0;
                $(
                    if command_id == next {
                        let command = strata_core::archive::load_from_bytes::<$cmd>(payload)
                            .map_err(|cause| $crate::server::DispatchError::Decode {
                                name: <$cmd as $crate::command::Command>::NAME,
                                cause,
                            })?;
                        return Ok($name::$variant(command));
                    }
                    next += 1;
                )+
                let _ = next;
                Err($crate::server::DispatchError::UnknownCommand(command_id))
            }

            async fn dispatch(
                self,
                handler: &H,
            ) -> Result<Vec<u8>, $crate::server::HandlerFailure> {
                match self {
                    $(
                        $name::$variant(command) => {
                            let response =
                                $crate::server::Handle::<$cmd>::handle(handler, command).await?;
                            Ok(strata_core::archive::save_to_bytes(&response))
                        }
                    )+
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Handle, HandlerFailure};
    use strata_core::archive::{load_from_bytes, save_to_bytes};
    use strata_core::impl_archive_struct;

    #[derive(Debug, Clone, PartialEq)]
    struct Ping {
        value: u64,
    }
    impl_archive_struct!(Ping { value });
    impl Command for Ping {
        type Response = u64;
        const NAME: &'static str = "test.ping";
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Echo {
        text: String,
    }
    impl_archive_struct!(Echo { text });
    impl Command for Echo {
        type Response = String;
        const NAME: &'static str = "test.echo";
    }

    command_set! {
        enum TestCommands {
            Ping(Ping),
            Echo(Echo),
        }
    }

    struct TestHandler;

    impl Handle<Ping> for TestHandler {
        async fn handle(&self, ping: Ping) -> Result<u64, HandlerFailure> {
            Ok(ping.value + 1)
        }
    }

    impl Handle<Echo> for TestHandler {
        async fn handle(&self, echo: Echo) -> Result<String, HandlerFailure> {
            Ok(echo.text)
        }
    }

    #[test]
    fn names_are_in_declaration_order() {
        assert_eq!(TestCommands::NAMES, &["test.ping", "test.echo"]);
    }

    #[test]
    fn member_ids_follow_declaration_order() {
        assert_eq!(<TestCommands as Member<Ping>>::ID, 0);
        assert_eq!(<TestCommands as Member<Echo>>::ID, 1);
    }

    #[tokio::test]
    async fn decode_and_dispatch() {
        use crate::server::Dispatch;

        let payload = save_to_bytes(&Ping { value: 41 });
        let decoded = <TestCommands as Dispatch<TestHandler>>::decode(0, &payload).unwrap();
        let response = decoded.dispatch(&TestHandler).await.unwrap();
        assert_eq!(load_from_bytes::<u64>(&response).unwrap(), 42);
    }

    #[test]
    fn unknown_command_id_is_rejected() {
        use crate::server::{Dispatch, DispatchError};

        let err = <TestCommands as Dispatch<TestHandler>>::decode(9, &[]).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownCommand(9)));
    }
}

mod client;

pub use client::{
    ApiErrorClass, ByteRange, CalendarEvent, ChildrenPage, ConflictBehavior, DateTimeZone,
    DriveItem, EmailAddress, FileFacet, FileHashes, FolderFacet, GraphClient, GraphError, ItemKind,
    Organizer, ParentReference, RangeAck, UploadSession, User,
};
